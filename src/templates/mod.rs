//! Embedded templates for sandforge files.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::PromptsConfig;

/// Default `sandforge.toml` configuration.
pub(crate) const SANDFORGE_TOML: &str = include_str!("sandforge.toml");

/// System prompt for the coding agent.
pub(crate) const SYSTEM_PROMPT: &str = include_str!("system_prompt.md");

/// Prompt that turns a task summary into a fragment title.
pub(crate) const TITLE_PROMPT: &str = include_str!("title_prompt.md");

/// Prompt that turns a task summary into the user-facing reply.
pub(crate) const RESPONSE_PROMPT: &str = include_str!("response_prompt.md");

/// The three prompts a run uses, after applying file overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Prompts {
    pub system: String,
    pub title: String,
    pub response: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            system: SYSTEM_PROMPT.to_string(),
            title: TITLE_PROMPT.to_string(),
            response: RESPONSE_PROMPT.to_string(),
        }
    }
}

impl Prompts {
    /// Load prompts, reading any configured override files relative to `project_dir`.
    pub fn load(config: &PromptsConfig, project_dir: &Path) -> Result<Self> {
        let read = |path: &Option<String>, fallback: &str| -> Result<String> {
            match path {
                Some(path) => {
                    let full = project_dir.join(path);
                    std::fs::read_to_string(&full)
                        .with_context(|| format!("Failed to read prompt file: {}", full.display()))
                }
                None => Ok(fallback.to_string()),
            }
        };

        Ok(Self {
            system: read(&config.system, SYSTEM_PROMPT)?,
            title: read(&config.title, TITLE_PROMPT)?,
            response: read(&config.response, RESPONSE_PROMPT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_embedded_prompts_mention_marker() {
        assert!(SYSTEM_PROMPT.contains("<task_summary>"));
        assert!(TITLE_PROMPT.contains("3 words"));
    }

    #[test]
    fn test_default_config_template_parses() {
        let config: crate::config::Config = toml::from_str(SANDFORGE_TOML).unwrap();
        assert_eq!(config.run.max_iterations, 15);
        assert_eq!(config.prompts.system.as_deref(), Some("prompts/system.md"));
    }

    #[test]
    fn test_load_without_overrides_uses_embedded() {
        let dir = tempdir().unwrap();
        let prompts = Prompts::load(&PromptsConfig::default(), dir.path()).unwrap();
        assert_eq!(prompts, Prompts::default());
    }

    #[test]
    fn test_load_override_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("title.md"), "Name it").unwrap();
        let config = PromptsConfig {
            title: Some("title.md".to_string()),
            ..Default::default()
        };
        let prompts = Prompts::load(&config, dir.path()).unwrap();
        assert_eq!(prompts.title, "Name it");
        assert_eq!(prompts.system, SYSTEM_PROMPT);
    }

    #[test]
    fn test_load_missing_override_fails() {
        let dir = tempdir().unwrap();
        let config = PromptsConfig {
            system: Some("nope.md".to_string()),
            ..Default::default()
        };
        let err = Prompts::load(&config, dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to read prompt file"));
    }
}
