use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::scenario::Scenario;

pub mod file;

pub use file::JsonFileProgressStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("version conflict for {key}: expected {expected}, found {found}")]
    VersionConflict { key: String, expected: u64, found: u64 },
}

/// Identity of one student's run through one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressKey {
    pub student_id: String,
    pub scenario_id: String,
}

impl ProgressKey {
    pub fn new(student_id: impl Into<String>, scenario_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            scenario_id: scenario_id.into(),
        }
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.student_id, self.scenario_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationPhase {
    NotStarted,
    InScene,
    Completed,
}

/// How the student addressed a message: the whole scene or one persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Broadcast,
    Persona(String),
}

/// The student's side of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentMessage {
    pub recipient: Recipient,
    pub text: String,
}

impl StudentMessage {
    pub fn new(recipient: Recipient, text: impl Into<String>) -> Self {
        Self {
            recipient,
            text: text.into(),
        }
    }
}

/// One persona reply, stored with the student message it answers.
///
/// A broadcast answered by three personas is three entries sharing one `exchange`
/// number and one `student` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub scene_index: usize,
    /// Exchange number within the scene, starting at 1.
    pub exchange: u32,
    pub persona_id: String,
    pub student: StudentMessage,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn same_exchange(&self, other: &LogEntry) -> bool {
        self.scene_index == other.scene_index && self.exchange == other.exchange
    }
}

/// The distinct student messages in a slice of the log, oldest first.
///
/// A slice that starts mid-exchange still yields that exchange's message.
pub fn student_messages(log: &[LogEntry]) -> impl Iterator<Item = &StudentMessage> + '_ {
    log.iter()
        .enumerate()
        .filter(move |(index, entry)| *index == 0 || !log[*index - 1].same_exchange(entry))
        .map(|(_, entry)| &entry.student)
}

/// Durable progress of one student through one scenario.
///
/// The log is append-only and `seq` grows by one per entry. `scene_index` never
/// decreases and a set `completed_scenes` flag is never cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    pub key: ProgressKey,
    pub phase: SimulationPhase,
    pub scene_index: usize,
    pub turn_count: u32,
    pub completed_scenes: Vec<bool>,
    pub log: Vec<LogEntry>,
    pub completed: bool,
    /// Version the record had when loaded; bumped by the store on every save.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SimulationState {
    pub fn new(key: ProgressKey) -> Self {
        Self {
            key,
            phase: SimulationPhase::NotStarted,
            scene_index: 0,
            turn_count: 0,
            completed_scenes: Vec::new(),
            log: Vec::new(),
            completed: false,
            version: 0,
            started_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn begin(&mut self, scene_count: usize) {
        self.phase = SimulationPhase::InScene;
        self.scene_index = 0;
        self.turn_count = 0;
        self.completed_scenes = vec![false; scene_count];
        self.started_at = Some(Utc::now());
        self.touch();
    }

    /// Logs one persona's reply to the exchange in progress. The exchange number is
    /// the scene turn the reply belongs to, so it must be called before `turn_count`
    /// is incremented.
    pub fn record_reply(
        &mut self,
        student: &StudentMessage,
        persona_id: impl Into<String>,
        text: impl Into<String>,
    ) -> &LogEntry {
        let seq = self.log.last().map(|entry| entry.seq + 1).unwrap_or(1);
        self.log.push(LogEntry {
            seq,
            scene_index: self.scene_index,
            exchange: self.turn_count + 1,
            persona_id: persona_id.into(),
            student: student.clone(),
            text: text.into(),
            timestamp: Utc::now(),
        });
        self.touch();
        &self.log[self.log.len() - 1]
    }

    /// Whether a reply to the exchange in progress has been logged yet.
    pub fn exchange_started(&self) -> bool {
        self.log.last().is_some_and(|entry| {
            entry.scene_index == self.scene_index && entry.exchange == self.turn_count + 1
        })
    }

    /// Entries written since the given scene started.
    pub fn scene_log(&self, scene_index: usize) -> &[LogEntry] {
        let start = self
            .log
            .iter()
            .position(|entry| entry.scene_index == scene_index)
            .unwrap_or(self.log.len());
        let end = self.log[start..]
            .iter()
            .position(|entry| entry.scene_index != scene_index)
            .map(|offset| start + offset)
            .unwrap_or(self.log.len());
        &self.log[start..end]
    }

    /// The last `window` entries of the whole log.
    pub fn recent(&self, window: usize) -> &[LogEntry] {
        let start = self.log.len().saturating_sub(window);
        &self.log[start..]
    }

    /// Marks the active scene complete and moves to the next one, or finishes the run.
    /// Returns `true` when the whole scenario is now complete.
    pub fn complete_scene(&mut self, scene_count: usize) -> bool {
        if let Some(flag) = self.completed_scenes.get_mut(self.scene_index) {
            *flag = true;
        }
        self.turn_count = 0;

        if self.scene_index + 1 < scene_count {
            self.scene_index += 1;
        } else {
            self.phase = SimulationPhase::Completed;
            self.completed = true;
        }
        self.touch();
        self.completed
    }

    pub fn completed_scene_count(&self) -> usize {
        self.completed_scenes.iter().filter(|flag| **flag).count()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Read-only view returned to callers after every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub phase: SimulationPhase,
    pub scene_index: usize,
    pub scene_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    pub turn_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turns_remaining: Option<u32>,
    pub completed_scenes: usize,
    pub percent_complete: u8,
    pub completed: bool,
}

impl ProgressSummary {
    pub fn new(state: &SimulationState, scenario: &Scenario) -> Self {
        let scene_count = scenario.scene_count();
        let active = match state.phase {
            SimulationPhase::InScene => scenario.scene(state.scene_index),
            SimulationPhase::NotStarted | SimulationPhase::Completed => None,
        };
        let completed_scenes = state.completed_scene_count();
        let percent_complete = if state.completed {
            100
        } else if scene_count == 0 {
            0
        } else {
            ((completed_scenes * 100) / scene_count) as u8
        };

        Self {
            phase: state.phase,
            scene_index: state.scene_index,
            scene_count,
            scene_title: active.map(|scene| scene.title.clone()),
            objective: active.map(|scene| scene.goal.clone()),
            turn_count: state.turn_count,
            turns_remaining: active
                .and_then(|scene| scene.timeout_turns)
                .map(|limit| limit.saturating_sub(state.turn_count)),
            completed_scenes,
            percent_complete,
            completed: state.completed,
        }
    }
}

/// Durable per-(student, scenario) state.
///
/// `save` is a compare-and-swap on `SimulationState::version`: it succeeds only when the
/// stored version still equals the version the state was loaded at, and returns the new
/// version. A turn is either saved whole or not at all.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Returns the stored state, or a fresh `NotStarted` state at version 0.
    async fn load(&self, key: &ProgressKey) -> Result<SimulationState, StoreError>;

    async fn save(&self, state: &SimulationState) -> Result<u64, StoreError>;

    /// Drops the stored record. Returns whether one existed.
    async fn reset(&self, key: &ProgressKey) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    states: RwLock<HashMap<ProgressKey, SimulationState>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn load(&self, key: &ProgressKey) -> Result<SimulationState, StoreError> {
        let states = self.states.read().await;
        Ok(states
            .get(key)
            .cloned()
            .unwrap_or_else(|| SimulationState::new(key.clone())))
    }

    async fn save(&self, state: &SimulationState) -> Result<u64, StoreError> {
        let mut states = self.states.write().await;
        let found = states.get(&state.key).map(|stored| stored.version).unwrap_or(0);
        if found != state.version {
            return Err(StoreError::VersionConflict {
                key: state.key.to_string(),
                expected: state.version,
                found,
            });
        }

        let mut stored = state.clone();
        stored.version = found + 1;
        states.insert(stored.key.clone(), stored);
        Ok(found + 1)
    }

    async fn reset(&self, key: &ProgressKey) -> Result<bool, StoreError> {
        Ok(self.states.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::fixtures::two_scene_scenario;

    fn key() -> ProgressKey {
        ProgressKey::new("student-1", "launch")
    }

    fn broadcast(text: &str) -> StudentMessage {
        StudentMessage::new(Recipient::Broadcast, text)
    }

    #[test]
    fn replies_to_one_message_share_an_exchange() {
        let mut state = SimulationState::new(key());
        state.begin(2);
        let hello = broadcast("hello");
        assert!(!state.exchange_started());
        state.record_reply(&hello, "dana", "hi");
        assert!(state.exchange_started());
        let second = state.record_reply(&hello, "raj", "morning").clone();
        state.turn_count += 1;
        assert!(!state.exchange_started());
        let next = state.record_reply(&broadcast("numbers?"), "dana", "later").clone();

        assert_eq!(second.seq, 2);
        assert_eq!(second.exchange, 1);
        assert_eq!(next.exchange, 2);
        assert_eq!(state.log.len(), 3);

        let said: Vec<_> = student_messages(&state.log).map(|m| m.text.as_str()).collect();
        assert_eq!(said, vec!["hello", "numbers?"]);
        // A window that starts mid-exchange still carries that exchange's message.
        let said: Vec<_> = student_messages(&state.log[1..]).map(|m| m.text.as_str()).collect();
        assert_eq!(said, vec!["hello", "numbers?"]);
    }

    #[test]
    fn scene_log_only_covers_the_requested_scene() {
        let mut state = SimulationState::new(key());
        state.begin(2);
        state.record_reply(&broadcast("scene zero"), "dana", "ok");
        state.complete_scene(2);
        state.record_reply(&broadcast("scene one"), "dana", "reply");
        state.record_reply(&broadcast("scene one"), "raj", "reply");

        assert_eq!(state.scene_log(0).len(), 1);
        assert_eq!(state.scene_log(1).len(), 2);
        assert_eq!(state.scene_log(1)[0].exchange, 1);
        assert!(state.scene_log(5).is_empty());
    }

    #[test]
    fn completing_last_scene_finishes_run() {
        let mut state = SimulationState::new(key());
        state.begin(2);
        state.turn_count = 3;

        assert!(!state.complete_scene(2));
        assert_eq!(state.scene_index, 1);
        assert_eq!(state.turn_count, 0);

        assert!(state.complete_scene(2));
        assert_eq!(state.scene_index, 1);
        assert_eq!(state.phase, SimulationPhase::Completed);
        assert_eq!(state.completed_scenes, vec![true, true]);
    }

    #[test]
    fn recent_window_is_bounded() {
        let mut state = SimulationState::new(key());
        state.begin(1);
        for index in 0..10 {
            state.record_reply(&broadcast("go on"), "dana", format!("reply {index}"));
            state.turn_count += 1;
        }
        let recent = state.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].text, "reply 7");
    }

    #[test]
    fn summary_reports_objective_and_percentage() {
        let scenario = two_scene_scenario();
        let mut state = SimulationState::new(key());
        state.begin(2);
        state.complete_scene(2);
        state.turn_count = 1;

        let summary = ProgressSummary::new(&state, &scenario);
        assert_eq!(summary.percent_complete, 50);
        assert_eq!(summary.objective.as_deref(), Some("Recommend a launch date."));
        assert_eq!(summary.turns_remaining, Some(1));
    }

    #[tokio::test]
    async fn in_memory_store_rejects_stale_saves() {
        let store = InMemoryProgressStore::new();
        let mut first = store.load(&key()).await.expect("load");
        let stale = first.clone();

        first.begin(2);
        let version = store.save(&first).await.expect("first save");
        assert_eq!(version, 1);

        let error = store.save(&stale).await.unwrap_err();
        assert!(matches!(error, StoreError::VersionConflict { expected: 0, found: 1, .. }));
    }

    #[tokio::test]
    async fn reset_removes_record() {
        let store = InMemoryProgressStore::new();
        let mut state = store.load(&key()).await.expect("load");
        state.begin(1);
        store.save(&state).await.expect("save");

        assert!(store.reset(&key()).await.expect("reset"));
        let fresh = store.load(&key()).await.expect("load");
        assert_eq!(fresh.phase, SimulationPhase::NotStarted);
        assert_eq!(fresh.version, 0);
    }
}
