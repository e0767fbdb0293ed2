use serde::Deserialize;
use tracing::{debug, warn};

use super::{ToolContext, ToolOutcome};
use crate::sandbox::{CapturedOutput, OutputSink};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct TerminalArgs {
    command: String,
}

/// Buffers output and traces it as it streams.
struct TracingSink(CapturedOutput);

impl OutputSink for TracingSink {
    fn on_stdout(&mut self, chunk: &str) {
        debug!(stream = "stdout", chunk, "terminal output");
        self.0.on_stdout(chunk);
    }

    fn on_stderr(&mut self, chunk: &str) {
        debug!(stream = "stderr", chunk, "terminal output");
        self.0.on_stderr(chunk);
    }
}

pub(super) async fn run(args: TerminalArgs, ctx: &ToolContext<'_>) -> ToolOutcome {
    let command = args.command;
    ctx.progress
        .action(format!("Executing terminal command: `{command}`"))
        .await;

    let mut sink = TracingSink(CapturedOutput::default());
    let result = ctx.sandbox.run_command(&command, &mut sink).await;

    let failure = match result {
        Ok(output) if output.success() => return ToolOutcome::output(output.stdout),
        Ok(output) => format!(
            "Command `{command}` failed with exit code {}\nstdout: {}\nstderr: {}",
            output.exit_code, output.stdout, output.stderr
        ),
        Err(e) => {
            let captured = sink.0;
            format!(
                "Command `{command}` failed: {e}\nstdout: {}\nstderr: {}",
                captured.stdout, captured.stderr
            )
        }
    };

    warn!(command = %command, "Terminal command failed");
    ctx.progress
        .failure(format!("Command `{command}` failed."))
        .await;
    ToolOutcome::output(failure)
}
