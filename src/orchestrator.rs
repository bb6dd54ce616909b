use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use futures_util::future::try_join_all;
use handlebars::RenderError;
use serde::Serialize;
use thiserror::Error;
use tokio::time;

use crate::{
    commands::{Command, CommandInterpreter},
    config::{ResponseMode, SimulationConfig},
    generator::{Generation, GenerationRequest, ResponseGenerator},
    goals::{GoalEvaluator, GoalVerdict},
    metrics::{ExecutionTimer, MetricsCollector, TurnMetrics, TurnResult},
    progress::{
        ProgressKey, ProgressStore, ProgressSummary, Recipient, SimulationPhase, SimulationState,
        StoreError, StudentMessage,
    },
    prompts::{self, PromptBuilder},
    scenario::{Persona, Scenario, ScenarioError, ScenarioStore, Scene},
    types::TokenUsage,
    LLMError,
};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("scenario not found: {0}")]
    ScenarioNotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("response generation failed: {message}")]
    GenerationFailed { message: String, retryable: bool },
    #[error("progress for {key} was changed by another turn (expected version {expected}, found {found})")]
    VersionConflict { key: String, expected: u64, found: u64 },
    #[error("storage error: {0}")]
    Storage(StoreError),
    #[error(transparent)]
    InvalidScenario(ScenarioError),
    #[error("prompt render error: {0}")]
    Prompt(#[from] RenderError),
}

impl SimulationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SimulationError::GenerationFailed { retryable, .. } => *retryable,
            SimulationError::VersionConflict { .. } => true,
            _ => false,
        }
    }
}

impl From<StoreError> for SimulationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::VersionConflict { key, expected, found } => {
                SimulationError::VersionConflict { key, expected, found }
            }
            other => SimulationError::Storage(other),
        }
    }
}

impl From<ScenarioError> for SimulationError {
    fn from(error: ScenarioError) -> Self {
        match error {
            ScenarioError::NotFound(id) => SimulationError::ScenarioNotFound(id),
            other => SimulationError::InvalidScenario(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    GoalMet,
    TurnLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonaReply {
    pub persona_id: String,
    pub persona_name: String,
    pub text: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub command: Command,
    pub responses: Vec<PersonaReply>,
    /// Introductions, reminders and summaries. Never written to the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    pub progress: ProgressSummary,
    pub scene_transitioned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<TransitionReason>,
    pub goal_uncertain: bool,
}

#[derive(Debug, Clone)]
pub enum SimulationEvent {
    Started { key: ProgressKey },
    PersonaReplied { key: ProgressKey, persona_id: String, text: String },
    GenerationRetried { key: ProgressKey, persona_id: String, attempt: u32, error: String },
    SceneCompleted { key: ProgressKey, scene_index: usize, reason: TransitionReason },
    Completed { key: ProgressKey },
}

/// A turn computed inside the deadline and waiting to be persisted.
struct PreparedTurn {
    outcome: TurnOutcome,
    /// `None` for turns that change nothing.
    state: Option<SimulationState>,
    events: Vec<SimulationEvent>,
}

impl PreparedTurn {
    fn read_only(outcome: TurnOutcome) -> Self {
        Self {
            outcome,
            state: None,
            events: Vec::new(),
        }
    }
}

/// One async mutex per progress key; turns for different keys never contend.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<ProgressKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, key: &ProgressKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Entries only referenced by the table are idle.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.clone()).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ChatOrchestrator {
    scenarios: Arc<dyn ScenarioStore>,
    progress: Arc<dyn ProgressStore>,
    generator: Arc<dyn ResponseGenerator>,
    evaluator: Arc<dyn GoalEvaluator>,
    interpreter: CommandInterpreter,
    prompts: PromptBuilder,
    config: SimulationConfig,
    locks: KeyedLocks,
    metrics: Option<Arc<dyn MetricsCollector>>,
    event_callback: Option<Arc<dyn Fn(&SimulationEvent) + Send + Sync>>,
}

impl ChatOrchestrator {
    pub fn new(
        scenarios: Arc<dyn ScenarioStore>,
        progress: Arc<dyn ProgressStore>,
        generator: Arc<dyn ResponseGenerator>,
        evaluator: Arc<dyn GoalEvaluator>,
    ) -> Self {
        let config = SimulationConfig::default();
        Self {
            scenarios,
            progress,
            generator,
            evaluator,
            interpreter: CommandInterpreter::new(config.begin_keyword.clone()),
            prompts: PromptBuilder::new(),
            config,
            locks: KeyedLocks::new(),
            metrics: None,
            event_callback: None,
        }
    }

    pub fn with_config(mut self, config: SimulationConfig) -> Self {
        self.interpreter = CommandInterpreter::new(config.begin_keyword.clone());
        self.config = config;
        self
    }

    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_metrics_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(collector);
        self
    }

    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&SimulationEvent) + Send + Sync + 'static,
    ) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn scenarios(&self) -> &Arc<dyn ScenarioStore> {
        &self.scenarios
    }

    fn emit_event(&self, event: SimulationEvent) {
        if let Some(callback) = &self.event_callback {
            callback(&event);
        }
    }

    /// Runs one student turn. Turns for the same student and scenario are serialized;
    /// a failed or timed-out turn saves nothing.
    pub async fn handle_message(
        &self,
        student_id: &str,
        scenario_id: &str,
        text: &str,
    ) -> Result<TurnOutcome, SimulationError> {
        let key = ProgressKey::new(student_id, scenario_id);
        let lock = self.locks.lock_for(&key);
        let _guard = lock.lock().await;

        let timer = ExecutionTimer::new();
        let mut metrics = TurnMetrics::new(scenario_id, "unknown");
        tracing::debug!(key = %key, "turn started");

        // Only the read-and-generate phase races the deadline; a started save finishes.
        let timed = time::timeout(
            self.config.turn_timeout,
            self.prepare_turn(&key, text, &mut metrics),
        )
        .await;
        let result = match timed {
            Ok(Ok(prepared)) => self.commit(prepared).await,
            Ok(Err(error)) => Err(error),
            Err(_) => {
                tracing::warn!(
                    key = %key,
                    timeout_ms = self.config.turn_timeout.as_millis() as u64,
                    "turn timed out"
                );
                metrics.result = TurnResult::TimedOut;
                Err(SimulationError::GenerationFailed {
                    message: format!(
                        "turn exceeded {} ms",
                        self.config.turn_timeout.as_millis()
                    ),
                    retryable: true,
                })
            }
        };

        let result_kind = match &result {
            Ok(outcome) if outcome.scene_transitioned => TurnResult::Transitioned,
            Ok(outcome) if outcome.command.is_chat() => TurnResult::Responded,
            Ok(_) => TurnResult::Narrated,
            Err(_) if metrics.result == TurnResult::TimedOut => TurnResult::TimedOut,
            Err(SimulationError::GenerationFailed { .. }) => TurnResult::GenerationFailed,
            Err(_) => TurnResult::Rejected,
        };
        metrics.finalize(result_kind, timer.elapsed());

        match &result {
            Ok(outcome) => tracing::info!(
                key = %key,
                command = outcome.command.label(),
                responses = outcome.responses.len(),
                scene = outcome.progress.scene_index,
                transitioned = outcome.scene_transitioned,
                elapsed_ms = metrics.duration.as_millis() as u64,
                "turn finished"
            ),
            Err(error) => tracing::warn!(key = %key, error = %error, "turn failed"),
        }

        if let Some(collector) = &self.metrics {
            collector.record_turn(metrics);
        }
        result
    }

    /// Read-only view of a student's progress; never creates a record.
    pub async fn progress(
        &self,
        student_id: &str,
        scenario_id: &str,
    ) -> Result<ProgressSummary, SimulationError> {
        let scenario = self.scenarios.get_scenario(scenario_id).await?;
        let state = self
            .progress
            .load(&ProgressKey::new(student_id, scenario_id))
            .await?;
        Ok(ProgressSummary::new(&state, &scenario))
    }

    /// Drops a student's progress for one scenario. Returns whether a record existed.
    pub async fn reset(&self, student_id: &str, scenario_id: &str) -> Result<bool, SimulationError> {
        self.scenarios.get_scenario(scenario_id).await?;
        let key = ProgressKey::new(student_id, scenario_id);
        let lock = self.locks.lock_for(&key);
        let _guard = lock.lock().await;

        let existed = self.progress.reset(&key).await?;
        tracing::info!(key = %key, existed, "progress reset");
        Ok(existed)
    }

    /// Saves a prepared turn, then publishes its events.
    async fn commit(&self, prepared: PreparedTurn) -> Result<TurnOutcome, SimulationError> {
        let PreparedTurn {
            outcome,
            state,
            events,
        } = prepared;
        if let Some(state) = state {
            let version = self.progress.save(&state).await?;
            tracing::trace!(key = %state.key, version, "turn saved");
        }
        for event in events {
            self.emit_event(event);
        }
        Ok(outcome)
    }

    async fn prepare_turn(
        &self,
        key: &ProgressKey,
        text: &str,
        metrics: &mut TurnMetrics,
    ) -> Result<PreparedTurn, SimulationError> {
        let scenario = self.scenarios.get_scenario(&key.scenario_id).await?;
        let state = self.progress.load(key).await?;
        metrics.scene_index = state.scene_index;

        match state.phase {
            SimulationPhase::Completed => Err(SimulationError::InvalidState(format!(
                "{key} has already completed \"{}\"",
                scenario.title
            ))),
            SimulationPhase::NotStarted => {
                let command = self.interpreter.classify(text, &[]);
                metrics.command = command.label().to_string();
                self.not_started_turn(&scenario, state, command)
            }
            SimulationPhase::InScene => {
                let (scene, personas) = active_scene(&scenario, &state)?;
                let command = self.interpreter.classify(text, &personas);
                metrics.command = command.label().to_string();

                let reply = match command {
                    Command::Begin => prompts::already_started(scene),
                    Command::Help => {
                        prompts::help(self.interpreter.begin_keyword(), Some(scene), &personas)
                    }
                    Command::Progress => prompts::progress(&ProgressSummary::new(&state, &scenario)),
                    Command::Mention { .. } | Command::PlainChat(_) => {
                        return self
                            .chat_turn(key, &scenario, scene, &personas, state, command, text, metrics)
                            .await;
                    }
                };
                Ok(PreparedTurn::read_only(narrated(command, reply, &state, &scenario)))
            }
        }
    }

    fn not_started_turn(
        &self,
        scenario: &Scenario,
        mut state: SimulationState,
        command: Command,
    ) -> Result<PreparedTurn, SimulationError> {
        let reply = match command {
            Command::Begin => {
                state.begin(scenario.scene_count());
                let (scene, personas) = active_scene(scenario, &state)?;
                let introduction = prompts::introduction(scenario, scene, &personas);
                tracing::info!(key = %state.key, scenes = scenario.scene_count(), "simulation started");

                let events = vec![SimulationEvent::Started {
                    key: state.key.clone(),
                }];
                return Ok(PreparedTurn {
                    outcome: narrated(command, introduction, &state, scenario),
                    state: Some(state),
                    events,
                });
            }
            Command::Help => prompts::help(self.interpreter.begin_keyword(), None, &[]),
            Command::Progress => prompts::progress(&ProgressSummary::new(&state, scenario)),
            Command::Mention { .. } | Command::PlainChat(_) => {
                prompts::not_started(scenario, self.interpreter.begin_keyword())
            }
        };
        Ok(PreparedTurn::read_only(narrated(command, reply, &state, scenario)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn chat_turn(
        &self,
        key: &ProgressKey,
        scenario: &Scenario,
        scene: &Scene,
        personas: &[&Persona],
        mut state: SimulationState,
        command: Command,
        raw_text: &str,
        metrics: &mut TurnMetrics,
    ) -> Result<PreparedTurn, SimulationError> {
        let (message, respondents) = match &command {
            Command::Mention { persona_id, remainder } => {
                let persona = personas
                    .iter()
                    .copied()
                    .find(|persona| persona.id == *persona_id)
                    .ok_or_else(|| {
                        SimulationError::InvalidState(format!("persona '{persona_id}' is not in scene '{}'", scene.id))
                    })?;
                let said = if remainder.is_empty() { raw_text.trim() } else { remainder.as_str() };
                (
                    StudentMessage::new(Recipient::Persona(persona.id.clone()), said),
                    vec![persona],
                )
            }
            Command::PlainChat(text) => (
                StudentMessage::new(Recipient::Broadcast, text.clone()),
                personas.to_vec(),
            ),
            Command::Begin | Command::Help | Command::Progress => {
                return Err(SimulationError::InvalidState(format!(
                    "'{}' is not a chat message",
                    command.label()
                )))
            }
        };

        let scene_index = state.scene_index;
        let attempts = AtomicU32::new(0);
        let generated = match self.config.response_mode {
            ResponseMode::Sequential => {
                self.respond_sequentially(key, scenario, scene, personas, &respondents, &message, &mut state, &attempts)
                    .await
            }
            ResponseMode::Concurrent => {
                self.respond_concurrently(key, scenario, scene, personas, &respondents, &message, &mut state, &attempts)
                    .await
            }
        };
        metrics.generation_attempts = attempts.load(Ordering::Relaxed);

        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(respondents.len());
        for (reply, usage) in generated? {
            if let Some(usage) = &usage {
                metrics.record_token_usage(usage);
            }
            events.push(SimulationEvent::PersonaReplied {
                key: key.clone(),
                persona_id: reply.persona_id.clone(),
                text: reply.text.clone(),
            });
            responses.push(reply);
        }
        metrics.respondents = responses.len();
        state.turn_count += 1;

        let verdict = self
            .evaluator
            .evaluate(scene, state.scene_log(scene_index))
            .await;
        let goal_uncertain = match &verdict {
            GoalVerdict::Uncertain(reason) => {
                tracing::warn!(key = %key, scene = %scene.id, reason = %reason, "goal evaluation uncertain; treating as not met");
                true
            }
            GoalVerdict::Met | GoalVerdict::NotMet => false,
        };
        metrics.goal_uncertain = goal_uncertain;

        let transition = if verdict.is_met() {
            Some(TransitionReason::GoalMet)
        } else if scene
            .timeout_turns
            .is_some_and(|limit| state.turn_count >= limit)
        {
            Some(TransitionReason::TurnLimit)
        } else {
            None
        };

        let narration = match transition {
            Some(reason) => Some(self.advance(key, scenario, &mut state, reason, &mut events)?),
            None => None,
        };

        let outcome = TurnOutcome {
            command,
            responses,
            narration,
            progress: ProgressSummary::new(&state, scenario),
            scene_transitioned: transition.is_some(),
            transition,
            goal_uncertain,
        };
        Ok(PreparedTurn {
            outcome,
            state: Some(state),
            events,
        })
    }

    fn advance(
        &self,
        key: &ProgressKey,
        scenario: &Scenario,
        state: &mut SimulationState,
        reason: TransitionReason,
        events: &mut Vec<SimulationEvent>,
    ) -> Result<String, SimulationError> {
        let finished_scene = state.scene_index;
        let finished = state.complete_scene(scenario.scene_count());
        tracing::info!(key = %key, scene = finished_scene, reason = ?reason, "scene completed");
        events.push(SimulationEvent::SceneCompleted {
            key: key.clone(),
            scene_index: finished_scene,
            reason,
        });

        if finished {
            tracing::info!(key = %key, "simulation completed");
            events.push(SimulationEvent::Completed { key: key.clone() });
            return Ok(prompts::completion_summary(scenario, state));
        }

        let (scene, personas) = active_scene(scenario, state)?;
        Ok(prompts::introduction(scenario, scene, &personas))
    }

    /// Each persona sees the replies already given in this exchange.
    #[allow(clippy::too_many_arguments)]
    async fn respond_sequentially(
        &self,
        key: &ProgressKey,
        scenario: &Scenario,
        scene: &Scene,
        personas: &[&Persona],
        respondents: &[&Persona],
        message: &StudentMessage,
        state: &mut SimulationState,
        attempts: &AtomicU32,
    ) -> Result<Vec<(PersonaReply, Option<TokenUsage>)>, SimulationError> {
        let mut replies = Vec::with_capacity(respondents.len());
        for persona in respondents.iter().copied() {
            let request = self.generation_request(scenario, scene, persona, personas, message, state)?;
            let generation = self.generate_with_retry(key, request, attempts).await?;
            replies.push(append_reply(state, persona, message, generation));
        }
        Ok(replies)
    }

    /// All personas answer the same snapshot; replies are logged in declaration order
    /// whatever order they complete in.
    #[allow(clippy::too_many_arguments)]
    async fn respond_concurrently(
        &self,
        key: &ProgressKey,
        scenario: &Scenario,
        scene: &Scene,
        personas: &[&Persona],
        respondents: &[&Persona],
        message: &StudentMessage,
        state: &mut SimulationState,
        attempts: &AtomicU32,
    ) -> Result<Vec<(PersonaReply, Option<TokenUsage>)>, SimulationError> {
        let requests = respondents
            .iter()
            .map(|persona| self.generation_request(scenario, scene, persona, personas, message, state))
            .collect::<Result<Vec<_>, _>>()?;

        let generations = try_join_all(
            requests
                .into_iter()
                .map(|request| self.generate_with_retry(key, request, attempts)),
        )
        .await?;

        Ok(respondents
            .iter()
            .copied()
            .zip(generations)
            .map(|(persona, generation)| append_reply(state, persona, message, generation))
            .collect())
    }

    fn generation_request(
        &self,
        scenario: &Scenario,
        scene: &Scene,
        persona: &Persona,
        personas: &[&Persona],
        message: &StudentMessage,
        state: &SimulationState,
    ) -> Result<GenerationRequest, SimulationError> {
        let others: Vec<&Persona> = personas
            .iter()
            .copied()
            .filter(|other| other.id != persona.id)
            .collect();
        // Once someone has answered, the message is already part of the history.
        let pending = (!state.exchange_started()).then_some(message);
        let messages = self.prompts.persona_messages(
            scenario,
            scene,
            persona,
            &others,
            state.recent(self.config.history_window),
            pending,
        )?;

        Ok(GenerationRequest {
            persona_id: persona.id.clone(),
            persona_name: persona.name.clone(),
            messages,
        })
    }

    async fn generate_with_retry(
        &self,
        key: &ProgressKey,
        request: GenerationRequest,
        attempts: &AtomicU32,
    ) -> Result<Generation, SimulationError> {
        let max_attempts = self.config.max_generation_attempts.max(1);
        let timeout = self.config.generation_timeout;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            attempts.fetch_add(1, Ordering::Relaxed);
            let error = match time::timeout(timeout, self.generator.generate(request.clone())).await {
                Ok(Ok(generation)) => return Ok(generation),
                Ok(Err(error)) => error,
                Err(_) => LLMError::Timeout(timeout.as_millis() as u64),
            };

            if !error.is_transient() {
                tracing::error!(key = %key, persona = %request.persona_id, error = %error, "generation failed permanently");
                return Err(SimulationError::GenerationFailed {
                    message: error.to_string(),
                    retryable: false,
                });
            }

            tracing::warn!(
                key = %key,
                persona = %request.persona_id,
                attempt,
                max_attempts,
                error = %error,
                "generation attempt failed"
            );
            if attempt < max_attempts {
                self.emit_event(SimulationEvent::GenerationRetried {
                    key: key.clone(),
                    persona_id: request.persona_id.clone(),
                    attempt,
                    error: error.to_string(),
                });
            }
            last_error = Some(error);
        }

        Err(SimulationError::GenerationFailed {
            message: last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no generation attempts were made".to_string()),
            retryable: true,
        })
    }
}

fn append_reply(
    state: &mut SimulationState,
    persona: &Persona,
    message: &StudentMessage,
    generation: Generation,
) -> (PersonaReply, Option<TokenUsage>) {
    let seq = state
        .record_reply(message, persona.id.clone(), generation.text.clone())
        .seq;
    let reply = PersonaReply {
        persona_id: persona.id.clone(),
        persona_name: persona.name.clone(),
        text: generation.text,
        seq,
    };
    (reply, generation.usage)
}

fn narrated(command: Command, narration: String, state: &SimulationState, scenario: &Scenario) -> TurnOutcome {
    TurnOutcome {
        command,
        responses: Vec::new(),
        narration: Some(narration),
        progress: ProgressSummary::new(state, scenario),
        scene_transitioned: false,
        transition: None,
        goal_uncertain: false,
    }
}

/// Resolves the active scene and its personas, failing if stored state points at
/// something the scenario no longer has.
fn active_scene<'a>(
    scenario: &'a Scenario,
    state: &SimulationState,
) -> Result<(&'a Scene, Vec<&'a Persona>), SimulationError> {
    let scene = scenario.scene(state.scene_index).ok_or_else(|| {
        tracing::error!(
            key = %state.key,
            scene_index = state.scene_index,
            scenes = scenario.scene_count(),
            "stored scene index is out of range"
        );
        SimulationError::InvalidState(format!(
            "scene {} does not exist in scenario '{}'",
            state.scene_index, scenario.id
        ))
    })?;

    let personas = scenario.scene_personas(scene).map_err(|error| {
        tracing::error!(key = %state.key, scene = %scene.id, error = %error, "scene persona missing");
        SimulationError::InvalidState(error.to_string())
    })?;

    Ok((scene, personas))
}
