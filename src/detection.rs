//! Completion detection for agent runs.
//!
//! The agent signals that its task is finished by including a fixed marker
//! in an assistant text response. When the marker is present, the whole
//! response becomes the run's summary.

use tracing::debug;

/// Detects the terminal marker in assistant text.
#[derive(Debug, Clone)]
pub(crate) struct TerminalMarker {
    marker: String,
}

impl TerminalMarker {
    /// Create a detector for the given marker substring.
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// The marker this detector looks for.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Return the run summary if `text` contains the marker.
    ///
    /// The summary is the entire response text, not only the marked span.
    pub fn detect(&self, text: &str) -> Option<String> {
        if self.marker.is_empty() || !text.contains(&self.marker) {
            return None;
        }
        debug!(marker = %self.marker, length = text.len(), "Terminal marker detected");
        Some(text.to_string())
    }
}
