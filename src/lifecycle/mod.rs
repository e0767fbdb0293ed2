//! The run lifecycle: setup, provision, execute, post-process, finalize.
//!
//! Each stage except execute goes through a [`StepRunner`] and only writes
//! to the progress record keyed by the run's fixed id, so retrying a stage or
//! redelivering the whole event never creates a second record. Finalize runs
//! whatever happened before it; a record never stays PROCESSING.

mod steps;

use steps::StepRunner;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::agent::{AgentStep, CompletionRequest, Message, ModelProvider};
use crate::config::Config;
use crate::detection::TerminalMarker;
use crate::network::{RunController, StopReason};
use crate::sandbox::{SandboxProvider, SandboxSession};
use crate::state::RunState;
use crate::store::{
    ChargeOutcome, FragmentUpdate, MessageStatus, MessageType, NewProgressRecord, ProgressRecord,
    ProgressStore, ProgressUpdate, StoreError,
};
use crate::templates::Prompts;
use crate::tools::{ProgressReporter, ToolRegistry};

/// Title used when the summary model gives nothing usable.
pub(crate) const FALLBACK_TITLE: &str = "New Thread";

/// Closing message used when the run cannot produce one.
pub(crate) const FALLBACK_RESPONSE: &str = "Something went wrong. Please try again.";

const SETUP_CONTENT: &str = "Setting up environment...";
const MAX_REQUEST_CHARS: usize = 1000;
const MAX_TITLE_WORDS: usize = 3;

// ---------------------------------------------------------------------------
// Trigger event and report
// ---------------------------------------------------------------------------

/// The event that starts a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunRequest {
    #[serde(alias = "value")]
    pub request_text: String,
    pub thread_id: String,
    pub user_id: String,
    /// Stable id of the run's progress record. Generated when absent.
    #[serde(default)]
    pub run_id: Option<Uuid>,
}

impl RunRequest {
    pub fn new(
        request_text: impl Into<String>,
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            request_text: request_text.into(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            run_id: None,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Reject empty or oversized requests and missing ids.
    pub fn validate(&self) -> Result<()> {
        let text = self.request_text.trim();
        if text.is_empty() {
            anyhow::bail!("Message is required");
        }
        if text.chars().count() > MAX_REQUEST_CHARS {
            anyhow::bail!("Message is too long (max {MAX_REQUEST_CHARS} characters)");
        }
        if self.thread_id.trim().is_empty() {
            anyhow::bail!("Thread id is required");
        }
        if self.user_id.trim().is_empty() {
            anyhow::bail!("User id is required");
        }
        Ok(())
    }

    /// Fix the run id so every retry and redelivery targets the same record.
    pub fn ensure_run_id(&mut self) -> Uuid {
        *self.run_id.get_or_insert_with(Uuid::new_v4)
    }
}

/// Outcome of one lifecycle invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunReport {
    pub record_id: Uuid,
    pub status: MessageStatus,
    pub iterations: u32,
    /// `None` when the run never reached a stop, or was already finalized.
    pub stop_reason: Option<StopReason>,
    pub file_count: usize,
    /// First stage error, if any.
    pub error: Option<String>,
}

impl RunReport {
    fn from_record(record: &ProgressRecord) -> Self {
        Self {
            record_id: record.id,
            status: record.status,
            iterations: 0,
            stop_reason: None,
            file_count: record.fragment.as_ref().map_or(0, |f| f.files.len()),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == MessageStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Output of the post-process stage.
struct PostProcess {
    title: String,
    response: String,
}

/// Runs one request end to end against explicit dependencies.
pub(crate) struct RunLifecycle {
    sandbox: Arc<dyn SandboxProvider>,
    model: Arc<dyn ModelProvider>,
    store: Arc<dyn ProgressStore>,
    prompts: Prompts,
    steps: StepRunner,
    agent_model: String,
    summary_model: String,
    temperature: Option<f64>,
    template: String,
    lifetime: Duration,
    preview_port: u16,
    max_iterations: u32,
    terminal_marker: String,
}

impl RunLifecycle {
    pub fn new(
        config: &Config,
        sandbox: Arc<dyn SandboxProvider>,
        model: Arc<dyn ModelProvider>,
        store: Arc<dyn ProgressStore>,
        prompts: Prompts,
    ) -> Self {
        Self {
            sandbox,
            model,
            store,
            prompts,
            steps: StepRunner::new(
                config.run.step_retries,
                Duration::from_millis(config.run.retry_delay_ms),
            ),
            agent_model: config.model.agent_model.clone(),
            summary_model: config.model.summary_model.clone(),
            temperature: config.model.temperature,
            template: config.sandbox.template.clone(),
            lifetime: config.sandbox.lifetime(),
            preview_port: config.sandbox.preview_port,
            max_iterations: config.run.max_iterations,
            terminal_marker: config.run.terminal_marker.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// Run `request` through every stage.
    ///
    /// Errors are returned only when the record could not be created or
    /// finalized; stage failures end in a FAILED record and a report.
    pub async fn run(&self, request: &RunRequest) -> Result<RunReport> {
        request.validate()?;
        let mut request = request.clone();
        let record_id = request.ensure_run_id();

        let span = info_span!(
            "run",
            %record_id,
            thread_id = %request.thread_id,
            user_id = %request.user_id
        );
        self.run_stages(&request, record_id).instrument(span).await
    }

    async fn run_stages(&self, request: &RunRequest, record_id: Uuid) -> Result<RunReport> {
        let record = self
            .steps
            .run("setup", || self.setup(request, record_id))
            .await?;
        if record.status.is_terminal() {
            info!(
                event = "run_already_finalized",
                status = %record.status,
                "Record is already final; skipping run"
            );
            return Ok(RunReport::from_record(&record));
        }

        let progress = ProgressReporter::new(self.store.clone(), record_id);
        let mut state = RunState::new(request.request_text.clone());

        let (stop_reason, post, failure) = match self.provision_and_execute(&mut state, &progress).await {
            Ok(reason) => {
                let post = match state.summary_text() {
                    Some(summary) => Some(self.post_process(summary, &progress).await),
                    None => None,
                };
                (Some(reason), post, None)
            }
            Err(e) => {
                error!(event = "run_stage_failed", error = %format!("{e:#}"), "Run stage failed");
                (None, None, Some(format!("{e:#}")))
            }
        };

        let success = failure.is_none() && state.is_success();
        let record = self
            .steps
            .run("finalize", || {
                self.finalize(
                    request,
                    record_id,
                    &state,
                    success,
                    post.as_ref().map(|p| p.response.as_str()),
                )
            })
            .await?;

        info!(
            event = "run_finished",
            status = %record.status,
            iterations = state.iteration_count,
            files = state.files.len(),
            title = post.as_ref().map(|p| p.title.as_str()),
            "Run finished"
        );

        Ok(RunReport {
            record_id,
            status: record.status,
            iterations: state.iteration_count,
            stop_reason,
            file_count: record.fragment.as_ref().map_or(0, |f| f.files.len()),
            error: failure,
        })
    }

    // -- stages --------------------------------------------------------------

    async fn setup(&self, request: &RunRequest, record_id: Uuid) -> Result<ProgressRecord> {
        info!(event = "stage_start", stage = "setup", "Creating progress record");
        self.store
            .create_record(NewProgressRecord::placeholder(
                record_id,
                &request.thread_id,
                &request.user_id,
                SETUP_CONTENT,
            ))
            .await
            .context("Failed to create progress record")
    }

    async fn provision_and_execute(
        &self,
        state: &mut RunState,
        progress: &ProgressReporter,
    ) -> Result<StopReason> {
        let session = self
            .steps
            .run("provision", || self.provision(progress.record_id()))
            .await?;
        state.sandbox_id = session.sandbox_id().to_string();

        info!(event = "stage_start", stage = "execute", sandbox_id = %state.sandbox_id, "Starting agent");
        let step = AgentStep::new(
            self.model.clone(),
            self.agent_model.clone(),
            self.prompts.system.clone(),
            self.temperature,
            TerminalMarker::new(self.terminal_marker.clone()),
        );
        let controller = RunController::new(step, ToolRegistry::new(), self.max_iterations);
        controller
            .run(state, session.as_ref(), progress)
            .await
            .context("Agent run failed")
    }

    async fn provision(&self, record_id: Uuid) -> Result<Box<dyn SandboxSession>> {
        info!(event = "stage_start", stage = "provision", backend = self.sandbox.name(), "Provisioning sandbox");
        self.write(record_id, ProgressUpdate::new().content("Creating sandbox..."))
            .await?;

        let sandbox_id = self
            .sandbox
            .provision(&self.template, self.lifetime)
            .await
            .with_context(|| format!("Failed to provision sandbox from template '{}'", self.template))?;

        match self.attach(record_id, &sandbox_id).await {
            Ok(session) => Ok(session),
            Err(e) => {
                // A retried provision creates a fresh sandbox
                if let Err(destroy) = self.sandbox.destroy(&sandbox_id).await {
                    warn!(%sandbox_id, error = %destroy, "Failed to destroy abandoned sandbox");
                }
                Err(e)
            }
        }
    }

    /// Connect to a provisioned sandbox and publish its preview URL.
    async fn attach(&self, record_id: Uuid, sandbox_id: &str) -> Result<Box<dyn SandboxSession>> {
        self.write(
            record_id,
            ProgressUpdate::new()
                .content("Sandbox created. Connecting to sandbox...")
                .fragment(FragmentUpdate::default().sandbox_id(sandbox_id)),
        )
        .await?;

        self.write(record_id, ProgressUpdate::new().content("Connecting to sandbox..."))
            .await?;
        let session = self
            .sandbox
            .connect(sandbox_id)
            .await
            .with_context(|| format!("Failed to connect to sandbox {sandbox_id}"))?;
        let host = session
            .host(self.preview_port)
            .await
            .context("Failed to resolve sandbox host")?;
        self.write(
            record_id,
            ProgressUpdate::new()
                .content("Sandbox connected. Starting agent...")
                .fragment(
                    FragmentUpdate::default()
                        .sandbox_url(format!("{}://{host}", session.preview_scheme())),
                ),
        )
        .await?;

        info!(%sandbox_id, %host, "Sandbox ready");
        Ok(session)
    }

    /// Derive the fragment title and the closing message. Never fails.
    async fn post_process(&self, summary: &str, progress: &ProgressReporter) -> PostProcess {
        info!(event = "stage_start", stage = "post_process", "Generating title and response");

        progress
            .update(ProgressUpdate::new().content("Generating fragment title..."))
            .await;
        let title = match self
            .steps
            .run("generate_title", || self.summarize(&self.prompts.title, summary))
            .await
        {
            Ok(Some(raw)) => normalize_title(&raw).unwrap_or_else(|| FALLBACK_TITLE.to_string()),
            Ok(None) => FALLBACK_TITLE.to_string(),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Title generation failed");
                FALLBACK_TITLE.to_string()
            }
        };
        progress
            .update(ProgressUpdate::new().fragment(FragmentUpdate::default().title(&title)))
            .await;

        progress
            .update(ProgressUpdate::new().content("Generating response..."))
            .await;
        let response = match self
            .steps
            .run("generate_response", || self.summarize(&self.prompts.response, summary))
            .await
        {
            Ok(Some(text)) => text.trim().to_string(),
            Ok(None) => FALLBACK_RESPONSE.to_string(),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Response generation failed");
                FALLBACK_RESPONSE.to_string()
            }
        };
        progress
            .update(ProgressUpdate::new().content(&response))
            .await;

        PostProcess { title, response }
    }

    /// One tool-less call to the summary model. `None` when it returned no text.
    async fn summarize(&self, prompt: &str, summary: &str) -> Result<Option<String>> {
        let history = [Message::user(summary)];
        let request = CompletionRequest {
            model: &self.summary_model,
            system_prompt: prompt,
            history: &history,
            tools: &[],
            temperature: self.temperature,
        };
        let response = self
            .model
            .generate(&request)
            .await
            .with_context(|| format!("{} summary completion failed", self.model.name()))?;
        Ok(response.joined_text().filter(|text| !text.trim().is_empty()))
    }

    async fn finalize(
        &self,
        request: &RunRequest,
        record_id: Uuid,
        state: &RunState,
        success: bool,
        response: Option<&str>,
    ) -> Result<ProgressRecord> {
        info!(event = "stage_start", stage = "finalize", success, "Finalizing run");

        if !success {
            let update = ProgressUpdate::new()
                .content(response.unwrap_or(FALLBACK_RESPONSE))
                .message_type(MessageType::Error)
                .status(MessageStatus::Failed)
                .fragment(FragmentUpdate::default().files(Default::default()));
            return self.finish(record_id, update).await;
        }

        match self.store.charge_run(&request.user_id, record_id).await {
            Ok(ChargeOutcome::Charged { remaining }) => {
                info!(event = "credit_charged", remaining, "Charged one credit");
            }
            Ok(ChargeOutcome::AlreadyCharged) => {}
            Err(e @ (StoreError::InsufficientCredits { .. } | StoreError::UserNotFound { .. })) => {
                warn!(error = %e, "Run completed without charging a credit");
            }
            Err(e) => return Err(e).context("Failed to charge credit"),
        }

        self.finish(
            record_id,
            ProgressUpdate::new()
                .content(response.unwrap_or(FALLBACK_RESPONSE))
                .message_type(MessageType::Result)
                .status(MessageStatus::Completed)
                .fragment(FragmentUpdate::default().files(state.files.clone())),
        )
        .await
    }

    /// Write the terminal update. A record that is already final is returned as is.
    async fn finish(&self, record_id: Uuid, update: ProgressUpdate) -> Result<ProgressRecord> {
        match self.store.update_record(record_id, update).await {
            Ok(record) => Ok(record),
            Err(StoreError::InvalidTransition { from, to }) => {
                warn!(%from, %to, "Record was finalized elsewhere");
                self.store
                    .get_record(record_id)
                    .await?
                    .ok_or(StoreError::RecordNotFound { id: record_id })
                    .context("Failed to reload finalized record")
            }
            Err(e) => Err(e).context("Failed to finalize progress record"),
        }
    }

    async fn write(&self, record_id: Uuid, update: ProgressUpdate) -> Result<()> {
        self.store
            .update_record(record_id, update)
            .await
            .map(|_| ())
            .context("Failed to update progress record")
    }
}

/// Strip punctuation, keep at most three words, title-case each.
fn normalize_title(raw: &str) -> Option<String> {
    // Apostrophes join their word ("Mike's" stays one word)
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{2019}'))
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    let words: Vec<String> = cleaned
        .split_whitespace()
        .take(MAX_TITLE_WORDS)
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}
