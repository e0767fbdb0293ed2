//! Gemini `generateContent` adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::conversation::{
    CompletionRequest, Message, ModelResponse, OutputItem, TextContent, ToolInvocation, ToolSchema,
};
use super::{describe_http_failure, ModelProvider};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini API provider.
pub(crate) struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
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

    fn generate_content_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:generateContent",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, request: &CompletionRequest<'_>) -> Result<ModelResponse> {
        let body = GenerateContentRequest::from_request(request);
        debug!(
            model = request.model,
            contents = body.contents.len(),
            "Sending Gemini request"
        );

        let response = self
            .client
            .post(self.generate_content_url(request.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Gemini request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!(describe_http_failure("Gemini", status, &text));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .context("Failed to parse Gemini response")?;
        normalize_response(parsed)
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDeclaration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

impl GenerateContentRequest {
    fn from_request(request: &CompletionRequest<'_>) -> Self {
        let mut contents: Vec<Content> = Vec::new();

        for message in request.history {
            let (role, parts) = match message {
                Message::User { content } => ("user", vec![Part::text(content)]),
                Message::Assistant { content } => ("model", vec![Part::text(content)]),
                Message::ToolCalls { calls } => {
                    ("model", calls.iter().map(Part::function_call).collect())
                }
                Message::ToolResult { name, output, .. } => (
                    "user",
                    vec![Part::function_response(name, json!({ "output": output }))],
                ),
            };

            // Gemini expects alternating turns; merge consecutive same-role entries
            match contents.last_mut() {
                Some(last) if last.role == role => last.parts.extend(parts),
                _ => contents.push(Content {
                    role: role.to_string(),
                    parts,
                }),
            }
        }

        let system_instruction = (!request.system_prompt.trim().is_empty()).then(|| Content {
            role: "user".to_string(),
            parts: vec![Part::text(request.system_prompt)],
        });

        let tools = (!request.tools.is_empty()).then(|| {
            vec![ToolDeclaration {
                function_declarations: request.tools.iter().map(FunctionDeclaration::from).collect(),
            }]
        });

        Self {
            contents,
            system_instruction,
            tools,
            generation_config: request
                .temperature
                .map(|temperature| GenerationConfig { temperature }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn function_call(call: &ToolInvocation) -> Self {
        Self {
            function_call: Some(FunctionCall {
                name: call.name.clone(),
                args: call.arguments.clone(),
            }),
            thought_signature: call.signature.clone(),
            ..Default::default()
        }
    }

    fn function_response(name: &str, response: Value) -> Self {
        Self {
            function_response: Some(FunctionResponse {
                name: name.to_string(),
                response,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclaration {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolSchema> for FunctionDeclaration {
    fn from(schema: &ToolSchema) -> Self {
        let mut parameters = schema.parameters.clone();
        strip_unsupported_keywords(&mut parameters);
        Self {
            name: schema.name.clone(),
            description: schema.description.clone(),
            parameters,
        }
    }
}

/// Gemini's schema dialect rejects `additionalProperties`.
fn strip_unsupported_keywords(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };
    obj.remove("additionalProperties");
    if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for value in props.values_mut() {
            strip_unsupported_keywords(value);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        strip_unsupported_keywords(items);
    }
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

fn normalize_response(response: GenerateContentResponse) -> Result<ModelResponse> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .context("Gemini response did not contain any candidates")?;

    let mut texts = Vec::new();
    let mut calls = Vec::new();

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text.filter(|t| !t.is_empty()) {
            texts.push(text);
        }
        if let Some(fc) = part.function_call {
            calls.push(ToolInvocation {
                id: uuid::Uuid::new_v4().to_string(),
                name: fc.name,
                arguments: fc.args,
                signature: part.thought_signature,
            });
        }
    }

    if texts.is_empty() && calls.is_empty() {
        debug!(finish_reason = ?candidate.finish_reason, "Gemini returned an empty candidate");
    }

    let mut items = Vec::new();
    match texts.len() {
        0 => {}
        1 => items.push(OutputItem::Text(TextContent::Plain(texts.remove(0)))),
        _ => items.push(OutputItem::Text(TextContent::Parts(texts))),
    }
    items.extend(calls.into_iter().map(OutputItem::ToolCall));
    Ok(ModelResponse { items })
}
