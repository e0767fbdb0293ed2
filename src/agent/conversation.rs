//! Provider-neutral conversation types.
//!
//! Adapters translate these to and from their wire formats; nothing outside
//! `agent/` sees a provider payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum Message {
    /// User-authored text.
    User { content: String },
    /// Assistant-authored text.
    Assistant { content: String },
    /// A batch of tool invocations requested by the assistant.
    ToolCalls { calls: Vec<ToolInvocation> },
    /// The result of one tool invocation.
    ToolResult {
        call_id: String,
        name: String,
        output: String,
    },
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    /// Opaque provider token that must be echoed back with the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Declaration of a callable tool, with a JSON Schema for its arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Everything a provider needs to produce one completion.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CompletionRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub history: &'a [Message],
    pub tools: &'a [ToolSchema],
    pub temperature: Option<f64>,
}

/// Text content as providers return it: a single string or a list of parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TextContent {
    Plain(String),
    Parts(Vec<String>),
}

impl TextContent {
    /// Collapse to a single string.
    pub fn normalize(self) -> String {
        match self {
            Self::Plain(text) => text,
            Self::Parts(parts) => parts.concat(),
        }
    }
}

/// One item of model output.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OutputItem {
    Text(TextContent),
    ToolCall(ToolInvocation),
}

/// A complete model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ModelResponse {
    pub items: Vec<OutputItem>,
}

impl ModelResponse {
    /// A response holding one plain text item.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            items: vec![OutputItem::Text(TextContent::Plain(text.into()))],
        }
    }

    /// A response holding only tool calls.
    pub fn tool_calls(calls: Vec<ToolInvocation>) -> Self {
        Self {
            items: calls.into_iter().map(OutputItem::ToolCall).collect(),
        }
    }

    /// Tool calls in the order the model emitted them.
    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.items
            .iter()
            .filter_map(|item| match item {
                OutputItem::ToolCall(call) => Some(call.clone()),
                OutputItem::Text(_) => None,
            })
            .collect()
    }

    /// All text items joined, or `None` if the response has no text.
    pub fn joined_text(&self) -> Option<String> {
        let texts: Vec<String> = self
            .items
            .iter()
            .filter_map(|item| match item {
                OutputItem::Text(content) => Some(content.clone().normalize()),
                OutputItem::ToolCall(_) => None,
            })
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str) -> ToolInvocation {
        ToolInvocation {
            id: format!("call-{name}"),
            name: name.to_string(),
            arguments: json!({}),
            signature: None,
        }
    }

    #[test]
    fn test_text_content_normalize() {
        assert_eq!(TextContent::Plain("hi".into()).normalize(), "hi");
        assert_eq!(
            TextContent::Parts(vec!["a".into(), "b".into()]).normalize(),
            "ab"
        );
    }

    #[test]
    fn test_response_splits_calls_and_text() {
        let response = ModelResponse {
            items: vec![
                OutputItem::Text(TextContent::Plain("thinking".into())),
                OutputItem::ToolCall(call("terminal")),
                OutputItem::ToolCall(call("readFiles")),
            ],
        };
        let names: Vec<_> = response.calls().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["terminal", "readFiles"]);
        assert_eq!(response.joined_text().as_deref(), Some("thinking"));
    }

    #[test]
    fn test_response_without_text() {
        let response = ModelResponse::tool_calls(vec![call("terminal")]);
        assert!(response.joined_text().is_none());
        assert!(ModelResponse::default().calls().is_empty());
    }
}
