//! Sandbox gateway for remote code execution.
//!
//! A [`SandboxProvider`] provisions and reconnects to one execution
//! environment per run; the [`SandboxSession`] it returns exposes a shell,
//! a file system and the preview host. Two backends exist:
//!
//! - [`E2bProvider`]: hosted MicroVM sandboxes (requires `E2B_API_KEY`)
//! - [`DockerProvider`]: local containers from a template image
//!
//! Gateways never retry; callers decide what a failure means.

mod docker;
mod e2b;
mod error;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use docker::DockerProvider;
pub(crate) use e2b::E2bProvider;
pub(crate) use error::SandboxError;

use async_trait::async_trait;
use std::time::Duration;

/// Receives command output as it streams out of the sandbox.
pub(crate) trait OutputSink: Send {
    /// Called with each chunk written to stdout.
    fn on_stdout(&mut self, chunk: &str);
    /// Called with each chunk written to stderr.
    fn on_stderr(&mut self, chunk: &str);
}

/// Buffers both output streams in memory.
#[derive(Debug, Default, Clone)]
pub(crate) struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl OutputSink for CapturedOutput {
    fn on_stdout(&mut self, chunk: &str) {
        self.stdout.push_str(chunk);
    }

    fn on_stderr(&mut self, chunk: &str) {
        self.stderr.push_str(chunk);
    }
}

/// Final result of a command run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl CommandOutput {
    /// True when the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Creates and reconnects to sandboxes.
#[async_trait]
pub(crate) trait SandboxProvider: Send + Sync {
    /// Backend name for display.
    fn name(&self) -> &'static str;

    /// Provision a new sandbox from `template`. Returns its id.
    async fn provision(&self, template: &str, timeout: Duration) -> Result<String, SandboxError>;

    /// Connect to an already-provisioned sandbox.
    async fn connect(&self, sandbox_id: &str) -> Result<Box<dyn SandboxSession>, SandboxError>;

    /// Tear a sandbox down before its lifetime elapses.
    async fn destroy(&self, sandbox_id: &str) -> Result<(), SandboxError>;
}

/// A live connection to one sandbox.
#[async_trait]
pub(crate) trait SandboxSession: Send + Sync {
    /// Id of the sandbox this session is bound to.
    fn sandbox_id(&self) -> &str;

    /// Run a shell command, streaming output into `sink`.
    ///
    /// A nonzero exit is reported through [`CommandOutput::exit_code`], not as
    /// an error; errors mean the command could not be run at all.
    async fn run_command(
        &self,
        command: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<CommandOutput, SandboxError>;

    /// Write `content` to `path`, creating parent directories.
    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    /// Read the file at `path` as UTF-8 text.
    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Public hostname (without scheme) that routes to `port` in the sandbox.
    async fn host(&self, port: u16) -> Result<String, SandboxError>;

    /// URL scheme the preview host is served over.
    fn preview_scheme(&self) -> &str {
        "https"
    }
}
