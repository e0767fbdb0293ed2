//! The agent step executor: one request/response cycle with the model.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::debug;

use super::conversation::{CompletionRequest, Message, ToolInvocation, ToolSchema};
use super::ModelProvider;
use crate::detection::TerminalMarker;

/// What one agent step produced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepOutcome {
    /// The model requested tools. Text in the same response is ignored.
    ToolCalls(Vec<ToolInvocation>),
    /// The model answered in text; `summary` is set when the marker was found.
    Text {
        text: String,
        summary: Option<String>,
    },
}

/// Drives a model with a fixed system prompt and terminal marker.
pub(crate) struct AgentStep {
    provider: Arc<dyn ModelProvider>,
    model: String,
    system_prompt: String,
    temperature: Option<f64>,
    marker: TerminalMarker,
}

impl AgentStep {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        temperature: Option<f64>,
        marker: TerminalMarker,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: system_prompt.into(),
            temperature,
            marker,
        }
    }

    /// Run one completion over `history`.
    pub async fn step(&self, history: &[Message], tools: &[ToolSchema]) -> Result<StepOutcome> {
        let request = CompletionRequest {
            model: &self.model,
            system_prompt: &self.system_prompt,
            history,
            tools,
            temperature: self.temperature,
        };

        let response = self
            .provider
            .generate(&request)
            .await
            .with_context(|| format!("{} completion failed", self.provider.name()))?;

        let calls = response.calls();
        if !calls.is_empty() {
            debug!(count = calls.len(), "Agent requested tool calls");
            return Ok(StepOutcome::ToolCalls(calls));
        }

        let text = response.joined_text().unwrap_or_default();
        let summary = self.marker.detect(&text);
        Ok(StepOutcome::Text { text, summary })
    }
}
