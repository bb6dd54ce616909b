use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LLMError,
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub organization: Option<String>,
    pub request_timeout: Duration,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Reads `OPENAI_API_KEY` plus the optional `OPENAI_BASE_URL`,
    /// `OPENAI_ORGANIZATION` and `OPENAI_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, LLMError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| LLMError::MissingApiKey("OPENAI_API_KEY"))?;
        let mut config = Self::new(api_key);

        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        config.organization = env::var("OPENAI_ORGANIZATION").ok();
        if let Some(ms) = env::var("OPENAI_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
        {
            config.request_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Client for OpenAI's chat-completions endpoint, or any server that speaks it.
#[derive(Debug, Clone)]
pub struct OpenAI {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAI {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LLMError> {
        Self::from_config(OpenAIConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, LLMError> {
        Self::from_config(OpenAIConfig::from_env()?)
    }

    pub fn from_config(config: OpenAIConfig) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

impl From<CompletionRequest> for ChatCompletionBody {
    fn from(request: CompletionRequest) -> Self {
        Self {
            model: request.model,
            messages: request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            response_format: request.response_format,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(default)]
    code: Option<Value>,
}

/// Keeps the status so the retry policy can tell a rate limit from a bad key.
fn status_error(status: StatusCode, body: &str) -> LLMError {
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => match envelope.error.code {
            Some(Value::String(code)) => format!("{} ({code})", envelope.error.message),
            _ => envelope.error.message,
        },
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string(),
        Err(_) => body.trim().to_string(),
    };
    LLMError::Status {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl LLMProvider for OpenAI {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let mut builder = self
            .client
            .post(self.config.completions_url())
            .bearer_auth(&self.config.api_key);
        if let Some(organization) = &self.config.organization {
            builder = builder.header("OpenAI-Organization", organization);
        }

        let response = builder.json(&ChatCompletionBody::from(request)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = status_error(status, &body);
            tracing::debug!(status = status.as_u16(), error = %error, "chat completion rejected");
            return Err(error);
        }

        let completion: ChatCompletion = response.json().await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or(LLMError::InvalidResponse("response did not contain any choices"))?;

        Ok(CompletionResponse {
            message: choice.message,
            usage: completion.usage,
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_url_ignores_trailing_slash() {
        let config = OpenAIConfig::new("sk-test").with_base_url("https://example.test/v1/");
        assert_eq!(config.completions_url(), "https://example.test/v1/chat/completions");
    }

    #[test]
    fn body_skips_unset_options() {
        let request = CompletionRequest::new("gpt-4o-mini", vec![ChatMessage::user("hello")])
            .with_temperature(0.4);
        let json = serde_json::to_value(ChatCompletionBody::from(request)).expect("serializes");
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn error_status_decides_whether_to_retry() {
        let bad_key = status_error(
            StatusCode::UNAUTHORIZED,
            r#"{"error": {"message": "Incorrect API key provided", "code": "invalid_api_key"}}"#,
        );
        assert!(matches!(&bad_key, LLMError::Status { status: 401, message }
            if message == "Incorrect API key provided (invalid_api_key)"));
        assert!(!bad_key.is_transient());

        let too_long = status_error(StatusCode::BAD_REQUEST, r#"{"error": {"message": "context length exceeded"}}"#);
        assert!(!too_long.is_transient());
        assert!(!status_error(StatusCode::NOT_FOUND, "").is_transient());

        let rate_limited = status_error(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(&rate_limited, LLMError::Status { message, .. } if message == "slow down"));
        assert!(rate_limited.is_transient());
        assert!(status_error(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, "<html>").is_transient());
    }
}
