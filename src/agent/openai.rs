//! OpenAI-compatible chat completions adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::conversation::{
    CompletionRequest, Message, ModelResponse, OutputItem, TextContent, ToolInvocation, ToolSchema,
};
use super::{describe_http_failure, ModelProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI (or compatible) chat completions provider.
pub(crate) struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, request: &CompletionRequest<'_>) -> Result<ModelResponse> {
        let body = ChatRequest::from_request(request);
        debug!(
            model = request.model,
            messages = body.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!(describe_http_failure("OpenAI", status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;
        normalize_response(parsed)
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

impl<'a> ChatRequest<'a> {
    fn from_request(request: &CompletionRequest<'a>) -> Self {
        let mut messages = Vec::with_capacity(request.history.len() + 1);
        if !request.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::text("system", request.system_prompt));
        }
        for message in request.history {
            messages.push(match message {
                Message::User { content } => ChatMessage::text("user", content),
                Message::Assistant { content } => ChatMessage::text("assistant", content),
                Message::ToolCalls { calls } => ChatMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: Some(calls.iter().map(WireToolCall::from).collect()),
                    tool_call_id: None,
                },
                Message::ToolResult {
                    call_id, output, ..
                } => ChatMessage {
                    role: "tool".to_string(),
                    content: Some(WireContent::Text(output.clone())),
                    tool_calls: None,
                    tool_call_id: Some(call_id.clone()),
                },
            });
        }

        Self {
            model: request.model,
            messages,
            tools: request.tools.iter().map(ToolDefinition::from).collect(),
            temperature: request.temperature,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(WireContent::Text(content.to_string())),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Message content is either a string or an array of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WirePart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object.
    #[serde(default)]
    arguments: String,
}

impl From<&ToolInvocation> for WireToolCall {
    fn from(call: &ToolInvocation) -> Self {
        Self {
            id: call.id.clone(),
            kind: function_type(),
            function: WireFunction {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolDefinition {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionDefinition,
}

#[derive(Debug, Serialize)]
struct FunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolSchema> for ToolDefinition {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            kind: "function",
            function: FunctionDefinition {
                name: schema.name.clone(),
                description: schema.description.clone(),
                parameters: schema.parameters.clone(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

fn normalize_response(response: ChatResponse) -> Result<ModelResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .context("Chat completion response did not contain any choices")?;

    let mut items = Vec::new();
    match choice.message.content {
        Some(WireContent::Text(text)) if !text.is_empty() => {
            items.push(OutputItem::Text(TextContent::Plain(text)));
        }
        Some(WireContent::Parts(parts)) => {
            let texts: Vec<String> = parts
                .into_iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text)
                .collect();
            if !texts.is_empty() {
                items.push(OutputItem::Text(TextContent::Parts(texts)));
            }
        }
        _ => {}
    }

    for call in choice.message.tool_calls.unwrap_or_default() {
        // Some compatible servers send arguments that are not valid JSON
        let arguments = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::String(call.function.arguments));
        items.push(OutputItem::ToolCall(ToolInvocation {
            id: call.id,
            name: call.function.name,
            arguments,
            signature: None,
        }));
    }

    Ok(ModelResponse { items })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_maps_tool_turns() {
        let history = vec![
            Message::user("build a counter"),
            Message::ToolCalls {
                calls: vec![ToolInvocation {
                    id: "call_1".to_string(),
                    name: "terminal".to_string(),
                    arguments: json!({"command": "npm i"}),
                    signature: None,
                }],
            },
            Message::ToolResult {
                call_id: "call_1".to_string(),
                name: "terminal".to_string(),
                output: "ok".to_string(),
            },
        ];
        let request = CompletionRequest {
            model: "gpt-4.1",
            system_prompt: "system",
            history: &history,
            tools: &[],
            temperature: None,
        };
        let body = serde_json::to_value(ChatRequest::from_request(&request)).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], r#"{"command":"npm i"}"#);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_normalize_tool_calls() {
        let raw = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "a", "type": "function", "function": {"name": "readFiles", "arguments": "{\"files\":[\"x\"]}"}},
                        {"id": "b", "type": "function", "function": {"name": "terminal", "arguments": "not json"}}
                    ]
                }
            }]
        });
        let parsed: ChatResponse = serde_json::from_value(raw).unwrap();
        let response = normalize_response(parsed).unwrap();
        let calls = response.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, json!({"files": ["x"]}));
        assert_eq!(calls[1].arguments, Value::String("not json".to_string()));
        assert!(response.joined_text().is_none());
    }

    #[test]
    fn test_normalize_content_parts() {
        let raw = json!({
            "choices": [{"message": {"role": "assistant", "content": [
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "world"}
            ]}}]
        });
        let parsed: ChatResponse = serde_json::from_value(raw).unwrap();
        let response = normalize_response(parsed).unwrap();
        assert_eq!(response.joined_text().as_deref(), Some("Hello world"));
    }

    #[test]
    fn test_normalize_without_choices_fails() {
        let parsed: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(normalize_response(parsed).is_err());
    }
}
