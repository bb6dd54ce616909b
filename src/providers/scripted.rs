use std::{
    collections::VecDeque,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Delayed(String, Duration),
    Fail(String),
}

/// Replays canned replies in order; used for offline runs and tests.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|reply| ScriptedReply::Text(reply.into()))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// Reply returned once the script is exhausted.
    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        let next = self.replies.lock().ok()?.pop_front();
        next.or_else(|| self.fallback.clone().map(ScriptedReply::Text))
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let content = match self.next_reply() {
            Some(ScriptedReply::Text(text)) => text,
            Some(ScriptedReply::Delayed(text, delay)) => {
                tokio::time::sleep(delay).await;
                text
            }
            Some(ScriptedReply::Fail(message)) => return Err(LLMError::Provider(message)),
            None => return Err(LLMError::Provider("no more scripted responses".to_string())),
        };

        Ok(CompletionResponse {
            message: ChatMessage::assistant(content),
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_then_falls_back() {
        let provider = ScriptedProvider::from_replies(["first"]).with_fallback("again");
        let request = CompletionRequest::new("model", vec![ChatMessage::user("hi")]);

        let first = provider.complete(request.clone()).await.expect("scripted reply");
        let second = provider.complete(request).await.expect("fallback reply");

        assert_eq!(first.message.text(), Some("first"));
        assert_eq!(second.message.text(), Some("again"));
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_is_an_error() {
        let provider = ScriptedProvider::new();
        provider.push(ScriptedReply::Fail("boom".into()));
        let request = CompletionRequest::new("model", Vec::new());

        assert!(matches!(
            provider.complete(request.clone()).await,
            Err(LLMError::Provider(message)) if message == "boom"
        ));
        assert!(provider.complete(request).await.is_err());
    }
}
