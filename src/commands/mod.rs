//! CLI command implementations.
//!
//! Each submodule implements one sandforge command. The builders below turn
//! a loaded [`Config`] into the explicit dependencies a run needs; nothing
//! is held in module-level state.

pub mod credits;
mod format;
pub mod init;
pub mod run;
pub mod status;
pub mod worker;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::agent::{GeminiProvider, ModelProvider, OpenAiProvider, Provider};
use crate::config::{require_env, Config, ModelConfig, SandboxBackend, SandboxConfig, StoreBackend};
use crate::lifecycle::RunLifecycle;
use crate::sandbox::{DockerProvider, E2bProvider, SandboxProvider};
use crate::store::{InMemoryStore, ProgressStore, SqliteStore};
use crate::templates::Prompts;

/// Loaded configuration plus the directory it was loaded from.
pub(crate) struct Project {
    pub dir: PathBuf,
    pub config: Config,
}

impl Project {
    /// Load `sandforge.toml` from the current directory.
    pub fn load() -> Result<Self> {
        let dir = std::env::current_dir().context("Failed to get current directory")?;
        let config = Config::load(&dir)?;
        Ok(Self { dir, config })
    }

    pub async fn store(&self) -> Result<Arc<dyn ProgressStore>> {
        open_store(&self.config, &self.dir).await
    }
}

/// Open the configured progress store.
pub(crate) async fn open_store(config: &Config, project_dir: &Path) -> Result<Arc<dyn ProgressStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            debug!("Using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            let path = config.store.database_path(project_dir)?;
            debug!(path = %path.display(), "Opening sqlite store");
            let store = SqliteStore::open(&path)
                .await
                .with_context(|| format!("Failed to open store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

/// Build the configured model provider, reading its API key from the environment.
pub(crate) fn model_provider(config: &ModelConfig) -> Result<Arc<dyn ModelProvider>> {
    let provider = config.get_provider()?;
    let api_key = require_env(&config.api_key_var()?)?;
    let timeout = Duration::from_secs(config.request_timeout_secs);

    let model: Arc<dyn ModelProvider> = match provider {
        Provider::Gemini => Arc::new(GeminiProvider::new(api_key, config.base_url.clone(), timeout)?),
        Provider::OpenAi => Arc::new(OpenAiProvider::new(api_key, config.base_url.clone(), timeout)?),
    };
    Ok(model)
}

/// Build the configured sandbox backend.
pub(crate) fn sandbox_provider(config: &SandboxConfig) -> Result<Arc<dyn SandboxProvider>> {
    let sandbox: Arc<dyn SandboxProvider> = match config.backend {
        SandboxBackend::E2b => {
            let api_key = require_env(&config.e2b.api_key_env)?;
            Arc::new(E2bProvider::new(
                api_key,
                config.e2b.clone(),
                config.command_timeout(),
            )?)
        }
        SandboxBackend::Docker => Arc::new(DockerProvider::connect(
            config.docker.clone(),
            config.preview_port,
            config.command_timeout(),
        )?),
    };
    Ok(sandbox)
}

/// Wire a lifecycle from configuration.
pub(crate) fn build_lifecycle(project: &Project, store: Arc<dyn ProgressStore>) -> Result<RunLifecycle> {
    let prompts = Prompts::load(&project.config.prompts, &project.dir)?;
    let model = model_provider(&project.config.model)?;
    let sandbox = sandbox_provider(&project.config.sandbox)?;
    debug!(
        provider = model.name(),
        sandbox = sandbox.name(),
        "Lifecycle dependencies ready"
    );
    Ok(RunLifecycle::new(&project.config, sandbox, model, store, prompts))
}
