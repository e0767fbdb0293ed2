//! In-memory state of one run.
//!
//! Tool handlers never touch this directly; they return a [`StateDelta`]
//! that the run controller applies.

use std::collections::BTreeMap;

/// Mutable state of one pipeline run. Lives only for one lifecycle invocation.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunState {
    /// The user's natural-language instruction.
    pub request_text: String,
    /// Empty until provisioning succeeds.
    pub sandbox_id: String,
    /// Generated project files by relative path.
    pub files: BTreeMap<String, String>,
    /// Final agent text containing the terminal marker.
    pub summary: Option<String>,
    /// Agent invocations so far.
    pub iteration_count: u32,
}

/// Changes a tool call made to the run state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StateDelta {
    /// File writes that landed, in the order they were made.
    pub files: Vec<(String, String)>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl RunState {
    pub fn new(request_text: impl Into<String>) -> Self {
        Self {
            request_text: request_text.into(),
            ..Default::default()
        }
    }

    /// Merge a delta. Later writes to a path overwrite earlier ones.
    pub fn apply(&mut self, delta: StateDelta) {
        for (path, content) in delta.files {
            self.files.insert(path, content);
        }
    }

    /// Summary text if present and non-blank.
    pub fn summary_text(&self) -> Option<&str> {
        self.summary.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// The run succeeded: it has a summary and produced files.
    pub fn is_success(&self) -> bool {
        self.summary_text().is_some() && !self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(files: &[(&str, &str)]) -> StateDelta {
        StateDelta {
            files: files
                .iter()
                .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_apply_overwrites_in_order() {
        let mut state = RunState::new("build");
        state.apply(delta(&[("a.txt", "1"), ("b.txt", "2"), ("a.txt", "3")]));
        assert_eq!(state.files.len(), 2);
        assert_eq!(state.files["a.txt"], "3");
    }

    #[test]
    fn test_apply_same_delta_twice_is_idempotent() {
        let mut state = RunState::new("build");
        let d = delta(&[("app/page.tsx", "x"), ("app/layout.tsx", "y")]);
        state.apply(d.clone());
        let once = state.files.clone();
        state.apply(d);
        assert_eq!(state.files, once);
    }

    #[test]
    fn test_success_requires_summary_and_files() {
        let mut state = RunState::new("build");
        assert!(!state.is_success());

        state.summary = Some("<task_summary>done".to_string());
        assert!(!state.is_success());

        state.apply(delta(&[("app/page.tsx", "x")]));
        assert!(state.is_success());

        state.summary = Some("   ".to_string());
        assert!(!state.is_success());
    }

    #[test]
    fn test_files_without_summary_is_failure() {
        let mut state = RunState::new("build");
        state.apply(delta(&[("app/page.tsx", "x")]));
        assert!(!state.is_success());
    }
}
