use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TokenUsage;

/// How a turn ended, as seen by metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnResult {
    /// A command turn answered with narration only.
    Narrated,
    /// A chat turn that stayed in the same scene.
    Responded,
    /// A chat turn that completed the active scene.
    Transitioned,
    GenerationFailed,
    TimedOut,
    Rejected,
}

/// Metrics for one orchestrator turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub scenario_id: String,
    pub scene_index: usize,
    pub command: String,
    pub result: TurnResult,
    pub duration: Duration,
    pub respondents: usize,
    /// Generator calls made, retries included.
    pub generation_attempts: u32,
    pub goal_uncertain: bool,
    pub token_usage: TokenUsage,
    pub timestamp: DateTime<Utc>,
}

impl TurnMetrics {
    pub fn new(scenario_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            scene_index: 0,
            command: command.into(),
            result: TurnResult::Narrated,
            duration: Duration::default(),
            respondents: 0,
            generation_attempts: 0,
            goal_uncertain: false,
            token_usage: TokenUsage::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn record_token_usage(&mut self, usage: &TokenUsage) {
        self.token_usage.accumulate(usage);
    }

    pub fn finalize(&mut self, result: TurnResult, duration: Duration) {
        self.result = result;
        self.duration = duration;
    }

    pub fn succeeded(&self) -> bool {
        matches!(
            self.result,
            TurnResult::Narrated | TurnResult::Responded | TurnResult::Transitioned
        )
    }
}

pub trait MetricsCollector: Send + Sync {
    fn record_turn(&self, metrics: TurnMetrics);

    fn aggregated(&self) -> AggregatedMetrics;

    fn scenario_metrics(&self, scenario_id: &str) -> Vec<TurnMetrics>;

    fn clear(&self);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub total_turns: usize,
    pub success_rate: f64,
    pub average_turn_duration: Duration,
    pub total_tokens: u64,
    pub generation_attempts: u64,
    pub transitions: usize,
    pub uncertain_evaluations: usize,
    pub by_result: HashMap<TurnResult, usize>,
    pub by_scenario: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct InMemoryMetricsCollector {
    turns: Arc<RwLock<Vec<TurnMetrics>>>,
}

impl InMemoryMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            turns: Arc::new(RwLock::new(Vec::with_capacity(capacity))),
        }
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn record_turn(&self, metrics: TurnMetrics) {
        if let Ok(mut turns) = self.turns.write() {
            turns.push(metrics);
        }
    }

    fn aggregated(&self) -> AggregatedMetrics {
        let Ok(turns) = self.turns.read() else {
            return AggregatedMetrics::default();
        };
        if turns.is_empty() {
            return AggregatedMetrics::default();
        }

        let mut aggregated = AggregatedMetrics {
            total_turns: turns.len(),
            ..AggregatedMetrics::default()
        };
        let mut total_duration = Duration::default();
        let mut succeeded = 0usize;

        for turn in turns.iter() {
            total_duration += turn.duration;
            aggregated.total_tokens += turn.token_usage.total_tokens as u64;
            aggregated.generation_attempts += turn.generation_attempts as u64;
            if turn.succeeded() {
                succeeded += 1;
            }
            if turn.result == TurnResult::Transitioned {
                aggregated.transitions += 1;
            }
            if turn.goal_uncertain {
                aggregated.uncertain_evaluations += 1;
            }
            *aggregated.by_result.entry(turn.result).or_insert(0) += 1;
            *aggregated
                .by_scenario
                .entry(turn.scenario_id.clone())
                .or_insert(0) += 1;
        }

        aggregated.success_rate = succeeded as f64 / turns.len() as f64;
        aggregated.average_turn_duration = total_duration / turns.len() as u32;
        aggregated
    }

    fn scenario_metrics(&self, scenario_id: &str) -> Vec<TurnMetrics> {
        self.turns
            .read()
            .map(|turns| {
                turns
                    .iter()
                    .filter(|turn| turn.scenario_id == scenario_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn clear(&self) {
        if let Ok(mut turns) = self.turns.write() {
            turns.clear();
        }
    }
}

pub struct ExecutionTimer {
    start_time: Instant,
}

impl ExecutionTimer {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for ExecutionTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(result: TurnResult, tokens: u32) -> TurnMetrics {
        let mut metrics = TurnMetrics::new("launch", "chat");
        metrics.record_token_usage(&TokenUsage {
            prompt_tokens: tokens,
            completion_tokens: 0,
            total_tokens: tokens,
        });
        metrics.finalize(result, Duration::from_millis(20));
        metrics
    }

    #[test]
    fn failed_turns_lower_success_rate() {
        let collector = InMemoryMetricsCollector::new();
        collector.record_turn(turn(TurnResult::Responded, 10));
        collector.record_turn(turn(TurnResult::Transitioned, 5));
        collector.record_turn(turn(TurnResult::GenerationFailed, 0));
        collector.record_turn(turn(TurnResult::Narrated, 0));

        let aggregated = collector.aggregated();
        assert_eq!(aggregated.total_turns, 4);
        assert_eq!(aggregated.success_rate, 0.75);
        assert_eq!(aggregated.total_tokens, 15);
        assert_eq!(aggregated.transitions, 1);
        assert_eq!(aggregated.by_result.get(&TurnResult::GenerationFailed), Some(&1));
        assert_eq!(aggregated.average_turn_duration, Duration::from_millis(20));
    }

    #[test]
    fn empty_collector_aggregates_to_zero() {
        let collector = InMemoryMetricsCollector::new();
        assert_eq!(collector.aggregated().total_turns, 0);

        collector.record_turn(turn(TurnResult::Responded, 1));
        assert_eq!(collector.scenario_metrics("launch").len(), 1);
        assert!(collector.scenario_metrics("other").is_empty());
        collector.clear();
        assert_eq!(collector.aggregated().total_turns, 0);
    }
}
