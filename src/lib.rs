pub mod commands;
pub mod config;
pub mod error;
pub mod generator;
pub mod goals;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod scenario;
pub mod types;

pub use commands::{Command, CommandInterpreter};
pub use config::{ResponseMode, SimulationConfig};
pub use error::LLMError;
pub use generator::{Generation, GenerationRequest, ProviderResponseGenerator, ResponseGenerator};
pub use goals::{
    CriteriaGoalEvaluator, GoalEvaluator, GoalVerdict, LayeredGoalEvaluator, LlmGoalEvaluator,
};
pub use metrics::{InMemoryMetricsCollector, MetricsCollector, TurnMetrics, TurnResult};
pub use orchestrator::{
    ChatOrchestrator, KeyedLocks, PersonaReply, SimulationError, SimulationEvent,
    TransitionReason, TurnOutcome,
};
pub use progress::{
    student_messages, InMemoryProgressStore, JsonFileProgressStore, LogEntry, ProgressKey,
    ProgressStore, ProgressSummary, Recipient, SimulationPhase, SimulationState, StoreError,
    StudentMessage,
};
pub use prompts::PromptBuilder;
pub use providers::LLMProvider;
pub use scenario::{
    GoalCriteria, InMemoryScenarioStore, Persona, PersonalityTraits, Scenario, ScenarioError,
    ScenarioStore, ScenarioSummary, Scene,
};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
