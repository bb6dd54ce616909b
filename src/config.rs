use std::{env, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::commands::DEFAULT_BEGIN_KEYWORD;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_HISTORY_WINDOW: usize = 12;

/// How persona replies within one broadcast turn relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Each persona sees the replies given earlier in the same exchange.
    #[default]
    Sequential,
    /// All personas answer the same snapshot in parallel.
    Concurrent,
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(ResponseMode::Sequential),
            "concurrent" | "parallel" => Ok(ResponseMode::Concurrent),
            other => Err(format!("unknown response mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Log entries included in each persona prompt.
    pub history_window: usize,
    pub turn_timeout: Duration,
    pub generation_timeout: Duration,
    pub max_generation_attempts: u32,
    pub begin_keyword: String,
    pub response_mode: ResponseMode,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: Some(0.7),
            max_tokens: Some(400),
            history_window: DEFAULT_HISTORY_WINDOW,
            turn_timeout: Duration::from_secs(90),
            generation_timeout: Duration::from_secs(30),
            max_generation_attempts: 2,
            begin_keyword: DEFAULT_BEGIN_KEYWORD.to_string(),
            response_mode: ResponseMode::Sequential,
        }
    }
}

impl SimulationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `CASESIM_*` environment variables. Unparseable values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(model) = env::var("CASESIM_MODEL") {
            config.model = model;
        }
        if let Some(window) = parse_var::<usize>("CASESIM_HISTORY_WINDOW") {
            config.history_window = window.max(1);
        }
        if let Some(ms) = parse_var::<u64>("CASESIM_TURN_TIMEOUT_MS") {
            config.turn_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("CASESIM_GENERATION_TIMEOUT_MS") {
            config.generation_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32>("CASESIM_MAX_GENERATION_ATTEMPTS") {
            config.max_generation_attempts = attempts.max(1);
        }
        if let Ok(keyword) = env::var("CASESIM_BEGIN_KEYWORD") {
            if !keyword.trim().is_empty() {
                config.begin_keyword = keyword;
            }
        }
        if let Some(mode) = parse_var::<ResponseMode>("CASESIM_RESPONSE_MODE") {
            config.response_mode = mode;
        }

        config
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window.max(1);
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn with_max_generation_attempts(mut self, attempts: u32) -> Self {
        self.max_generation_attempts = attempts.max(1);
        self
    }

    pub fn with_begin_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.begin_keyword = keyword.into();
        self
    }

    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_mode_parses_aliases() {
        assert_eq!("Parallel".parse::<ResponseMode>(), Ok(ResponseMode::Concurrent));
        assert_eq!("sequential".parse::<ResponseMode>(), Ok(ResponseMode::Sequential));
        assert!("random".parse::<ResponseMode>().is_err());
    }

    #[test]
    fn builders_clamp_to_sane_minimums() {
        let config = SimulationConfig::new()
            .with_history_window(0)
            .with_max_generation_attempts(0);
        assert_eq!(config.history_window, 1);
        assert_eq!(config.max_generation_attempts, 1);
    }
}
