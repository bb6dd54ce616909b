//! Scene goal evaluation strategies.
//!
//! Every strategy leans toward "not met": a missed completion is recovered by the
//! scene's turn limit, a false completion is not recoverable.

use std::{fmt::Write, sync::Arc};

use async_trait::async_trait;
use evalexpr::{
    ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, Value,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::{
    progress::{student_messages, LogEntry, Recipient},
    scenario::{GoalCriteria, Scene},
    types::{ChatMessage, CompletionRequest},
    LLMProvider,
};

#[derive(Debug, Clone, PartialEq)]
pub enum GoalVerdict {
    Met,
    NotMet,
    Uncertain(String),
}

impl GoalVerdict {
    pub fn is_met(&self) -> bool {
        matches!(self, GoalVerdict::Met)
    }
}

#[async_trait]
pub trait GoalEvaluator: Send + Sync {
    /// Judges the active scene from the log entries written since it started.
    async fn evaluate(&self, scene: &Scene, scene_log: &[LogEntry]) -> GoalVerdict;
}

/// Evaluates structured criteria locally. Free-text criteria come back `Uncertain`.
#[derive(Debug, Clone, Default)]
pub struct CriteriaGoalEvaluator;

impl CriteriaGoalEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn judge(&self, criteria: &GoalCriteria, scene_log: &[LogEntry]) -> GoalVerdict {
        match criteria {
            GoalCriteria::Keywords { any_of, min_matches } => {
                let student_text = student_messages(scene_log)
                    .map(|message| message.text.to_lowercase())
                    .collect::<Vec<_>>()
                    .join("\n");
                let hits = any_of
                    .iter()
                    .map(|keyword| keyword.trim().to_lowercase())
                    .filter(|keyword| !keyword.is_empty() && student_text.contains(keyword.as_str()))
                    .count();
                if hits >= *min_matches {
                    GoalVerdict::Met
                } else {
                    GoalVerdict::NotMet
                }
            }
            GoalCriteria::Expression { expr } => match evaluate_expression(expr, scene_log) {
                Ok(true) => GoalVerdict::Met,
                Ok(false) => GoalVerdict::NotMet,
                Err(reason) => GoalVerdict::Uncertain(reason),
            },
            GoalCriteria::Description { .. } => {
                GoalVerdict::Uncertain("free-text criteria need a model judge".into())
            }
        }
    }
}

#[async_trait]
impl GoalEvaluator for CriteriaGoalEvaluator {
    async fn evaluate(&self, scene: &Scene, scene_log: &[LogEntry]) -> GoalVerdict {
        self.judge(&scene.criteria, scene_log)
    }
}

fn evaluate_expression(expr: &str, scene_log: &[LogEntry]) -> Result<bool, String> {
    let student_turns = student_messages(scene_log).count() as i64;
    let persona_turns = scene_log.len() as i64;
    let student_words = student_messages(scene_log)
        .map(|message| message.text.split_whitespace().count())
        .sum::<usize>() as i64;

    let mut context: HashMapContext<DefaultNumericTypes> = HashMapContext::new();
    for (name, value) in [
        ("student_turns", student_turns),
        ("persona_turns", persona_turns),
        ("student_words", student_words),
    ] {
        context
            .set_value(name.to_string(), Value::Int(value))
            .map_err(|err| err.to_string())?;
    }

    evalexpr::eval_boolean_with_context(expr, &context).map_err(|err| err.to_string())
}

const JUDGE_INSTRUCTIONS: &str = r#"
You judge whether a student has achieved the objective of one scene in a business case role-play.
Read the objective, the success criteria and the transcript of the scene.

Respond with a single JSON object and nothing else:
{"met": <true|false>, "confidence": <number between 0 and 1>, "reason": "<one sentence>"}

Rules:
- Only count what the student actually said or achieved in the transcript.
- If the evidence is partial or ambiguous, answer "met": false.
- Do not reward effort; the criteria must be satisfied.
"#;

#[derive(Debug, Deserialize)]
struct JudgeEnvelope {
    #[serde(alias = "goal_met", alias = "satisfied")]
    met: bool,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default, alias = "explanation")]
    reason: Option<String>,
}

/// Asks a model to judge the scene transcript against its criteria.
pub struct LlmGoalEvaluator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    min_confidence: f32,
    max_transcript_entries: usize,
}

impl LlmGoalEvaluator {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            min_confidence: 0.75,
            max_transcript_entries: 30,
        }
    }

    pub fn with_min_confidence(mut self, confidence: f32) -> Self {
        self.min_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_transcript_entries(mut self, entries: usize) -> Self {
        self.max_transcript_entries = entries.max(1);
        self
    }

    fn build_prompt(&self, scene: &Scene, scene_log: &[LogEntry]) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "Scene: {}", scene.title);
        let _ = writeln!(prompt, "Objective: {}", scene.goal);
        let _ = writeln!(prompt, "Success criteria: {}", criteria_text(&scene.criteria));
        prompt.push_str("\nTranscript:\n");

        let start = scene_log.len().saturating_sub(self.max_transcript_entries);
        let window = &scene_log[start..];
        for (index, entry) in window.iter().enumerate() {
            if index == 0 || !window[index - 1].same_exchange(entry) {
                match &entry.student.recipient {
                    Recipient::Broadcast => {
                        let _ = writeln!(prompt, "Student: {}", entry.student.text);
                    }
                    Recipient::Persona(id) => {
                        let _ = writeln!(prompt, "Student (to {id}): {}", entry.student.text);
                    }
                }
            }
            let _ = writeln!(prompt, "{}: {}", entry.persona_id, entry.text);
        }
        prompt
    }

    fn interpret(&self, content: &str) -> GoalVerdict {
        let Some(envelope) = parse_judge_envelope(content) else {
            return GoalVerdict::Uncertain("judge reply was not a verdict".into());
        };

        let confidence = envelope.confidence.unwrap_or(0.0);
        let reason = envelope.reason.unwrap_or_default();
        match (envelope.met, confidence >= self.min_confidence) {
            (true, true) => GoalVerdict::Met,
            (true, false) => GoalVerdict::Uncertain(format!(
                "judge leaned met at confidence {confidence:.2}: {reason}"
            )),
            (false, _) => GoalVerdict::NotMet,
        }
    }
}

#[async_trait]
impl GoalEvaluator for LlmGoalEvaluator {
    async fn evaluate(&self, scene: &Scene, scene_log: &[LogEntry]) -> GoalVerdict {
        if student_messages(scene_log).next().is_none() {
            return GoalVerdict::NotMet;
        }

        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(JUDGE_INSTRUCTIONS.trim()),
                ChatMessage::user(self.build_prompt(scene, scene_log)),
            ],
        )
        .with_temperature(0.0)
        .with_response_format(serde_json::json!({ "type": "json_object" }));

        match self.provider.complete(request).await {
            Ok(response) => self.interpret(response.message.text().unwrap_or_default()),
            Err(err) => GoalVerdict::Uncertain(format!("judge call failed: {err}")),
        }
    }
}

/// Structured criteria are judged locally; free-text criteria go to the model judge.
pub struct LayeredGoalEvaluator {
    structured: CriteriaGoalEvaluator,
    judge: Arc<dyn GoalEvaluator>,
}

impl LayeredGoalEvaluator {
    pub fn new(judge: Arc<dyn GoalEvaluator>) -> Self {
        Self {
            structured: CriteriaGoalEvaluator::new(),
            judge,
        }
    }
}

#[async_trait]
impl GoalEvaluator for LayeredGoalEvaluator {
    async fn evaluate(&self, scene: &Scene, scene_log: &[LogEntry]) -> GoalVerdict {
        match &scene.criteria {
            GoalCriteria::Description { .. } => self.judge.evaluate(scene, scene_log).await,
            criteria => self.structured.judge(criteria, scene_log),
        }
    }
}

pub fn criteria_text(criteria: &GoalCriteria) -> String {
    match criteria {
        GoalCriteria::Description { text } => text.clone(),
        GoalCriteria::Keywords { any_of, min_matches } => format!(
            "the student mentions at least {min_matches} of: {}",
            any_of.join(", ")
        ),
        GoalCriteria::Expression { expr } => format!("the condition `{expr}` holds"),
    }
}

static RE_FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*\n(.*?)```").unwrap());

/// Accepts bare JSON, a fenced block, or an object embedded in prose.
fn parse_judge_envelope(content: &str) -> Option<JudgeEnvelope> {
    let trimmed = content.trim();
    if let Ok(envelope) = serde_json::from_str::<JudgeEnvelope>(trimmed) {
        return Some(envelope);
    }

    if let Some(block) = RE_FENCED_BLOCK.captures(trimmed).and_then(|caps| caps.get(1)) {
        if let Ok(envelope) = serde_json::from_str::<JudgeEnvelope>(block.as_str().trim()) {
            return Some(envelope);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<JudgeEnvelope>(&trimmed[start..=end]).ok()
}
