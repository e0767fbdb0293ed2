//! The run controller: drives the agent until it reports completion or the
//! iteration budget runs out.

use anyhow::Result;
use tracing::{debug, info};

use crate::agent::{AgentStep, Message, StepOutcome};
use crate::sandbox::SandboxSession;
use crate::state::RunState;
use crate::tools::{ProgressReporter, ToolContext, ToolRegistry};

/// Why the controller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// The agent emitted the terminal marker.
    SummaryDetected,
    /// `max_iterations` agent invocations happened without a summary.
    IterationBudgetExhausted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SummaryDetected => write!(f, "summary detected"),
            Self::IterationBudgetExhausted => write!(f, "iteration budget exhausted"),
        }
    }
}

pub(crate) struct RunController {
    step: AgentStep,
    registry: ToolRegistry,
    max_iterations: u32,
}

impl RunController {
    pub fn new(step: AgentStep, registry: ToolRegistry, max_iterations: u32) -> Self {
        Self {
            step,
            registry,
            max_iterations,
        }
    }

    /// Run to a stop, mutating `state`.
    ///
    /// Each agent invocation is one iteration. Tool calls in one response are
    /// dispatched sequentially in the order given. Model errors propagate.
    pub async fn run(
        &self,
        state: &mut RunState,
        sandbox: &dyn SandboxSession,
        progress: &ProgressReporter,
    ) -> Result<StopReason> {
        let mut history = vec![Message::user(state.request_text.clone())];

        while state.iteration_count < self.max_iterations {
            let outcome = self.step.step(&history, self.registry.schemas()).await?;
            state.iteration_count += 1;
            let iteration = state.iteration_count;

            match outcome {
                StepOutcome::ToolCalls(calls) => {
                    debug!(iteration, count = calls.len(), "Dispatching tool calls");
                    history.push(Message::ToolCalls {
                        calls: calls.clone(),
                    });

                    for call in calls {
                        let outcome = {
                            let ctx = ToolContext {
                                sandbox,
                                progress,
                                files: &state.files,
                            };
                            self.registry.dispatch(&call, &ctx).await
                        };
                        state.apply(outcome.delta);
                        history.push(Message::ToolResult {
                            call_id: call.id,
                            name: call.name,
                            output: outcome.output,
                        });
                    }
                }
                StepOutcome::Text { text, summary } => {
                    history.push(Message::assistant(text));
                    if let Some(summary) = summary {
                        state.summary = Some(summary);
                        info!(
                            event = "summary_detected",
                            iteration,
                            files = state.files.len(),
                            "Agent reported completion"
                        );
                        return Ok(StopReason::SummaryDetected);
                    }
                    debug!(iteration, "Agent replied without the terminal marker");
                }
            }
        }

        info!(
            event = "iteration_budget_exhausted",
            iterations = state.iteration_count,
            "Agent did not report completion"
        );
        Ok(StopReason::IterationBudgetExhausted)
    }
}
