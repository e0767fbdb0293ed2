//! The fixed set of tools the agent can call.
//!
//! Every tool validates its arguments, runs against the sandbox session and
//! reports back a string for the agent plus a [`StateDelta`]. Failures are
//! returned as text so the agent can recover; they never abort the run.

mod files;
mod progress;
mod terminal;

pub(crate) use progress::ProgressReporter;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info_span, Instrument};

use crate::agent::{ToolInvocation, ToolSchema};
use crate::sandbox::SandboxSession;
use crate::state::StateDelta;

/// Names of the callable tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToolName {
    Terminal,
    CreateOrUpdateFiles,
    ReadFiles,
}

impl ToolName {
    pub const ALL: [Self; 3] = [Self::Terminal, Self::CreateOrUpdateFiles, Self::ReadFiles];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::CreateOrUpdateFiles => "createOrUpdateFiles",
            Self::ReadFiles => "readFiles",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    fn description(self) -> &'static str {
        match self {
            Self::Terminal => "Use the terminal to run commands",
            Self::CreateOrUpdateFiles => "Create or update files in the sandbox",
            Self::ReadFiles => "Read files from the sandbox",
        }
    }

    fn parameters(self) -> Value {
        match self {
            Self::Terminal => json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run"}
                },
                "required": ["command"],
                "additionalProperties": false
            }),
            Self::CreateOrUpdateFiles => json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": {"type": "string"},
                                "content": {"type": "string"}
                            },
                            "required": ["path", "content"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["files"],
                "additionalProperties": false
            }),
            Self::ReadFiles => json!({
                "type": "object",
                "properties": {
                    "files": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["files"],
                "additionalProperties": false
            }),
        }
    }

    pub fn schema(self) -> ToolSchema {
        ToolSchema {
            name: self.as_str().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a tool handler needs from the surrounding run.
pub(crate) struct ToolContext<'a> {
    pub sandbox: &'a dyn SandboxSession,
    pub progress: &'a ProgressReporter,
    /// Run files before this call.
    pub files: &'a BTreeMap<String, String>,
}

/// Result of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ToolOutcome {
    /// Text handed back to the agent.
    pub output: String,
    pub delta: StateDelta,
}

impl ToolOutcome {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            delta: StateDelta::default(),
        }
    }
}

/// Validates and dispatches tool calls.
#[derive(Debug, Clone)]
pub(crate) struct ToolRegistry {
    schemas: Vec<ToolSchema>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            schemas: ToolName::ALL.into_iter().map(ToolName::schema).collect(),
        }
    }

    /// Declarations sent to the model.
    pub fn schemas(&self) -> &[ToolSchema] {
        &self.schemas
    }

    /// Run one tool call.
    pub async fn dispatch(&self, call: &ToolInvocation, ctx: &ToolContext<'_>) -> ToolOutcome {
        let Some(tool) = ToolName::from_name(&call.name) else {
            debug!(tool = %call.name, "Agent called an unknown tool");
            ctx.progress
                .failure(format!("Unknown tool `{}`.", call.name))
                .await;
            return ToolOutcome::output(format!("Error: unknown tool '{}'", call.name));
        };

        let span = info_span!("tool", tool = %tool, call_id = %call.id);
        async {
            match tool {
                ToolName::Terminal => match parse_args(tool, &call.arguments) {
                    Ok(args) => terminal::run(args, ctx).await,
                    Err(message) => rejected(tool, message, ctx).await,
                },
                ToolName::CreateOrUpdateFiles => match parse_args(tool, &call.arguments) {
                    Ok(args) => files::create_or_update(args, ctx).await,
                    Err(message) => rejected(tool, message, ctx).await,
                },
                ToolName::ReadFiles => match parse_args(tool, &call.arguments) {
                    Ok(args) => files::read(args, ctx).await,
                    Err(message) => rejected(tool, message, ctx).await,
                },
            }
        }
        .instrument(span)
        .await
    }
}

async fn rejected(tool: ToolName, message: String, ctx: &ToolContext<'_>) -> ToolOutcome {
    ctx.progress
        .failure(format!("Invalid arguments for `{tool}`."))
        .await;
    ToolOutcome::output(message)
}

fn parse_args<T: DeserializeOwned>(tool: ToolName, arguments: &Value) -> Result<T, String> {
    serde_json::from_value(arguments.clone())
        .map_err(|e| format!("Error: invalid arguments for {tool}: {e}"))
}
