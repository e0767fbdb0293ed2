//! Mock model provider for testing.
//!
//! Provides a configurable mock that returns predetermined responses
//! for end-to-end run testing without calling a real model API.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::conversation::{CompletionRequest, Message, ModelResponse, ToolInvocation};
use super::ModelProvider;

/// A mock model provider for testing.
///
/// Returns configurable responses and tracks invocations for test assertions.
#[derive(Debug, Clone)]
pub(crate) struct MockModelProvider {
    /// Replies to return in order. Cycles if more invocations than replies.
    replies: Arc<Vec<MockReply>>,
    /// Number of times `generate` has been called.
    invocation_count: Arc<AtomicUsize>,
    /// History length seen by each call.
    history_lengths: Arc<Mutex<Vec<usize>>>,
    /// Last history seen.
    last_history: Arc<Mutex<Vec<Message>>>,
}

/// A single scripted reply.
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    /// Return this response.
    Respond(ModelResponse),
    /// Return an error with the given message.
    Error(String),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Respond(ModelResponse::text(text))
    }

    pub fn call(name: &str, arguments: serde_json::Value) -> Self {
        Self::Respond(ModelResponse::tool_calls(vec![ToolInvocation {
            id: format!("call-{name}"),
            name: name.to_string(),
            arguments,
            signature: None,
        }]))
    }
}

impl MockModelProvider {
    /// Create a new mock provider that returns the given replies in order.
    ///
    /// If invoked more times than replies, it cycles back to the first.
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(replies),
            invocation_count: Arc::new(AtomicUsize::new(0)),
            history_lengths: Arc::new(Mutex::new(Vec::new())),
            last_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always answers with the given text.
    pub fn always_text(text: &str) -> Self {
        Self::new(vec![MockReply::text(text)])
    }

    /// Create a mock that always fails with the given error.
    pub fn always_fail(error: &str) -> Self {
        Self::new(vec![MockReply::Error(error.to_string())])
    }

    /// Get the number of times `generate` was called.
    pub fn invocation_count(&self) -> usize {
        self.invocation_count.load(Ordering::SeqCst)
    }

    pub fn history_lengths(&self) -> Vec<usize> {
        self.history_lengths.lock().unwrap().clone()
    }

    pub fn last_history(&self) -> Vec<Message> {
        self.last_history.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for MockModelProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(&self, request: &CompletionRequest<'_>) -> Result<ModelResponse> {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);
        self.history_lengths
            .lock()
            .unwrap()
            .push(request.history.len());
        *self.last_history.lock().unwrap() = request.history.to_vec();

        match &self.replies[count % self.replies.len()] {
            MockReply::Respond(response) => Ok(response.clone()),
            MockReply::Error(msg) => anyhow::bail!("{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(history: &'a [Message]) -> CompletionRequest<'a> {
        CompletionRequest {
            model: "m",
            system_prompt: "",
            history,
            tools: &[],
            temperature: None,
        }
    }

    #[tokio::test]
    async fn test_mock_provider_cycles_replies() {
        let provider = MockModelProvider::new(vec![MockReply::text("first"), MockReply::text("second")]);

        let r1 = provider.generate(&request(&[])).await.unwrap();
        let r2 = provider.generate(&request(&[])).await.unwrap();
        let r3 = provider.generate(&request(&[])).await.unwrap();

        assert_eq!(r1.joined_text().as_deref(), Some("first"));
        assert_eq!(r2.joined_text().as_deref(), Some("second"));
        assert_eq!(r3.joined_text().as_deref(), Some("first")); // Cycles back
        assert_eq!(provider.invocation_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_provider_error() {
        let provider = MockModelProvider::always_fail("boom");
        let err = provider.generate(&request(&[])).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_mock_provider_records_history() {
        let provider = MockModelProvider::always_text("ok");
        let history = vec![Message::user("hi")];
        provider.generate(&request(&history)).await.unwrap();
        assert_eq!(provider.history_lengths(), vec![1]);
        assert_eq!(provider.last_history(), history);
    }
}
