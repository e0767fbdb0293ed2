use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::Provider;

pub(crate) const CONFIG_FILE: &str = "sandforge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Language model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Which provider to use: "gemini" or "openai"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model driving the coding agent loop
    #[serde(default = "default_agent_model")]
    pub agent_model: String,

    /// Model used for fragment titles and the user-facing response
    #[serde(default = "default_summary_model")]
    pub summary_model: String,

    /// Environment variable holding the API key
    /// - Gemini default: `GEMINI_API_KEY`
    /// - OpenAI default: `OPENAI_API_KEY`
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Override the provider's API base URL
    #[serde(default)]
    pub base_url: Option<String>,

    /// Sampling temperature (provider default if unset)
    #[serde(default)]
    pub temperature: Option<f64>,

    /// HTTP request timeout for a single completion
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            agent_model: default_agent_model(),
            summary_model: default_summary_model(),
            api_key_env: None,
            base_url: None,
            temperature: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ModelConfig {
    /// Parse the provider string into a Provider enum
    pub fn get_provider(&self) -> Result<Provider> {
        self.provider.parse()
    }

    /// Environment variable name the API key is read from
    pub fn api_key_var(&self) -> Result<String> {
        if let Some(ref var) = self.api_key_env {
            return Ok(var.clone());
        }
        Ok(match self.get_provider()? {
            Provider::Gemini => "GEMINI_API_KEY".to_string(),
            Provider::OpenAi => "OPENAI_API_KEY".to_string(),
        })
    }
}

fn default_provider() -> String {
    "gemini".to_string()
}

fn default_agent_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_summary_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    #[default]
    E2b,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Which sandbox backend provisions environments
    #[serde(default)]
    pub backend: SandboxBackend,

    /// Template (execution image) every run starts from
    #[serde(default = "default_template")]
    pub template: String,

    /// Sandbox lifetime in minutes, enforced by the provider
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u32,

    /// Timeout for a single terminal command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Port the template's dev server listens on
    #[serde(default = "default_preview_port")]
    pub preview_port: u16,

    #[serde(default)]
    pub e2b: E2bConfig,

    #[serde(default)]
    pub docker: DockerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::default(),
            template: default_template(),
            timeout_minutes: default_timeout_minutes(),
            command_timeout_secs: default_command_timeout(),
            preview_port: default_preview_port(),
            e2b: E2bConfig::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Sandbox lifetime as a `Duration`.
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_minutes) * 60)
    }

    /// Per-command timeout as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// E2B hosted sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct E2bConfig {
    /// Control-plane API
    #[serde(default = "default_e2b_api_url")]
    pub api_url: String,

    /// Domain sandbox hosts are served under
    #[serde(default = "default_e2b_domain")]
    pub domain: String,

    /// Environment variable holding the API key
    #[serde(default = "default_e2b_key_env")]
    pub api_key_env: String,

    /// User commands and file operations run as
    #[serde(default = "default_e2b_user")]
    pub user: String,

    /// Working directory inside the sandbox
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

impl Default for E2bConfig {
    fn default() -> Self {
        Self {
            api_url: default_e2b_api_url(),
            domain: default_e2b_domain(),
            api_key_env: default_e2b_key_env(),
            user: default_e2b_user(),
            workdir: default_workdir(),
        }
    }
}

/// Local Docker sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Working directory inside the container
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Hostname the published preview port is reachable on
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Scheme of the preview URL. Published ports serve the dev server directly.
    #[serde(default = "default_preview_scheme")]
    pub preview_scheme: String,

    /// Template id -> image reference. Unmapped templates are used as the image name.
    #[serde(default)]
    pub images: HashMap<String, String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            public_host: default_public_host(),
            preview_scheme: default_preview_scheme(),
            images: HashMap::new(),
        }
    }
}

impl DockerConfig {
    /// Resolve the image a template maps to.
    pub fn image_for(&self, template: &str) -> String {
        self.images
            .get(template)
            .cloned()
            .unwrap_or_else(|| template.to_string())
    }
}

fn default_template() -> String {
    "nextjs-15-4-5".to_string()
}

fn default_timeout_minutes() -> u32 {
    60
}

fn default_command_timeout() -> u64 {
    600
}

fn default_preview_port() -> u16 {
    3000
}

fn default_e2b_api_url() -> String {
    "https://api.e2b.dev".to_string()
}

fn default_e2b_domain() -> String {
    "e2b.app".to_string()
}

fn default_e2b_key_env() -> String {
    "E2B_API_KEY".to_string()
}

fn default_e2b_user() -> String {
    "user".to_string()
}

fn default_workdir() -> String {
    "/home/user".to_string()
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_preview_scheme() -> String {
    "http".to_string()
}

/// Agent run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Agent invocations before the run is stopped without a summary
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Substring that marks the agent's final summary
    #[serde(default = "default_terminal_marker")]
    pub terminal_marker: String,

    /// Retries for each retryable lifecycle stage (0 = run once)
    #[serde(default = "default_step_retries")]
    pub step_retries: u32,

    /// Base delay between stage retries, doubled per attempt
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Runs the worker executes at the same time
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            terminal_marker: default_terminal_marker(),
            step_retries: default_step_retries(),
            retry_delay_ms: default_retry_delay(),
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

fn default_max_iterations() -> u32 {
    15
}

fn default_terminal_marker() -> String {
    "<task_summary>".to_string()
}

fn default_step_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_max_concurrent_runs() -> usize {
    4
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Persistence configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file (defaults to the platform data directory)
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreConfig {
    /// Resolve the sqlite database path, expanding `~` and relative paths.
    pub fn database_path(&self, project_dir: &Path) -> Result<PathBuf> {
        match self.path {
            Some(ref path) => {
                let expanded = PathBuf::from(expand_path(path)?);
                if expanded.is_absolute() {
                    Ok(expanded)
                } else {
                    Ok(project_dir.join(expanded))
                }
            }
            None => {
                let data = dirs::data_dir().context("Could not determine data directory")?;
                Ok(data.join("sandforge").join("sandforge.db"))
            }
        }
    }
}

/// Daily credit allowance per plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    #[serde(default = "default_free_credits")]
    pub free: i64,
    #[serde(default = "default_pro_credits")]
    pub pro: i64,
    #[serde(default = "default_premium_credits")]
    pub premium: i64,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            free: default_free_credits(),
            pro: default_pro_credits(),
            premium: default_premium_credits(),
        }
    }
}

fn default_free_credits() -> i64 {
    5
}

fn default_pro_credits() -> i64 {
    30
}

fn default_premium_credits() -> i64 {
    60
}

/// Optional prompt override files, relative to the project directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit console logs as JSON
    #[serde(default)]
    pub json: bool,

    /// Directory for daily-rolling JSON log files
    #[serde(default)]
    pub directory: Option<String>,
}

/// Expand ~ to home directory
pub(crate) fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}

/// Read a required secret from the environment.
pub(crate) fn require_env(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => anyhow::bail!("Environment variable {var} is not set"),
    }
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }
}
