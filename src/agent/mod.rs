//! Language model providers and the agent step executor.
//!
//! This module provides a unified interface over chat-completion APIs:
//! - Gemini: `generateContent` with function declarations
//! - OpenAI: `chat/completions` with tools
//!
//! The provider is selected via `[model].provider` in sandforge.toml.

mod conversation;
mod gemini;
#[cfg(test)]
pub(crate) mod mock;
mod openai;
mod step;

pub(crate) use conversation::{
    CompletionRequest, Message, ModelResponse, OutputItem, TextContent, ToolInvocation,
    ToolSchema,
};
pub(crate) use gemini::GeminiProvider;
pub(crate) use openai::OpenAiProvider;
pub(crate) use step::{AgentStep, StepOutcome};

use anyhow::Result;
use async_trait::async_trait;

/// Trait for chat-completion model providers.
#[async_trait]
pub(crate) trait ModelProvider: Send + Sync {
    /// Returns the provider name for display.
    fn name(&self) -> &'static str;

    /// Generates one completion for the given conversation and tools.
    async fn generate(&self, request: &CompletionRequest<'_>) -> Result<ModelResponse>;
}

/// Supported model providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum Provider {
    /// Google Gemini API.
    #[default]
    Gemini,
    /// OpenAI-compatible chat completions API.
    OpenAi,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gemini => write!(f, "gemini"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            _ => anyhow::bail!("Unknown model provider: '{s}'. Supported: gemini, openai"),
        }
    }
}

/// Classify an HTTP failure from a model API.
///
/// Rate limits and server errors are worth retrying at the stage level;
/// client errors are not.
fn describe_http_failure(provider: &str, status: reqwest::StatusCode, body: &str) -> String {
    let kind = match status.as_u16() {
        401 | 403 => "authentication failed",
        429 => "rate limit exceeded",
        s if s >= 500 => "server error",
        _ => "request rejected",
    };
    let body = body.trim();
    let snippet: String = body.chars().take(500).collect();
    format!("{provider} {kind} ({status}): {snippet}")
}
