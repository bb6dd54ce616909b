use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::SimulationConfig,
    types::{ChatMessage, CompletionRequest, TokenUsage},
    LLMError, LLMProvider,
};

/// Everything needed to voice one persona for one reply.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub persona_id: String,
    pub persona_name: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// The single capability the orchestrator needs from a language model.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, LLMError>;
}

/// Adapts any [`LLMProvider`] into a [`ResponseGenerator`].
pub struct ProviderResponseGenerator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl ProviderResponseGenerator {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn from_config(provider: Arc<dyn LLMProvider>, config: &SimulationConfig) -> Self {
        Self::new(provider, config.model.clone())
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens)
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl ResponseGenerator for ProviderResponseGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, LLMError> {
        let mut completion = CompletionRequest::new(self.model.clone(), request.messages);
        if let Some(temperature) = self.temperature {
            completion = completion.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            completion = completion.with_max_tokens(max_tokens);
        }

        let response = self.provider.complete(completion).await?;
        let raw = response.message.text().unwrap_or_default();
        let text = strip_speaker_prefix(raw, &request.persona_name);
        if text.is_empty() {
            return Err(LLMError::InvalidResponse("model returned an empty reply"));
        }

        Ok(Generation {
            text,
            usage: response.usage,
        })
    }
}

/// Models often echo "Name:" ahead of an in-character reply.
fn strip_speaker_prefix(raw: &str, name: &str) -> String {
    let trimmed = raw.trim();
    let prefix = format!("{}:", name.to_lowercase());
    match trimmed.get(..prefix.len()) {
        Some(head) if head.to_lowercase() == prefix => trimmed[prefix.len()..].trim().to_string(),
        _ => trimmed.to_string(),
    }
}
