use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("provider call timed out after {0} ms")]
    Timeout(u64),
}

impl LLMError {
    /// Whether a later attempt with the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LLMError::Http(error) => !error.is_builder() && !error.is_decode(),
            LLMError::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            LLMError::Provider(_) | LLMError::InvalidResponse(_) | LLMError::Timeout(_) => true,
            LLMError::MissingApiKey(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_permanent() {
        let status = |status| LLMError::Status {
            status,
            message: String::new(),
        };
        for permanent in [400, 401, 403, 404, 422] {
            assert!(!status(permanent).is_transient(), "{permanent}");
        }
        for transient in [408, 429, 500, 503] {
            assert!(status(transient).is_transient(), "{transient}");
        }
        assert!(!LLMError::MissingApiKey("OPENAI_API_KEY").is_transient());
        assert!(LLMError::Timeout(100).is_transient());
    }
}
