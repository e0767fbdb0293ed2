use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::store::{MessageType, ProgressStore, ProgressUpdate};

/// Mirrors tool activity into a run's progress record.
///
/// Writes are best effort: a failed update is logged and the tool carries on.
#[derive(Clone)]
pub(crate) struct ProgressReporter {
    store: Arc<dyn ProgressStore>,
    record_id: Uuid,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn ProgressStore>, record_id: Uuid) -> Self {
        Self { store, record_id }
    }

    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    /// Show an in-progress action.
    pub async fn action(&self, content: impl Into<String>) {
        self.update(
            ProgressUpdate::new()
                .content(content)
                .message_type(MessageType::Text),
        )
        .await;
    }

    /// Show a recoverable tool failure.
    pub async fn failure(&self, content: impl Into<String>) {
        self.update(
            ProgressUpdate::new()
                .content(content)
                .message_type(MessageType::Error),
        )
        .await;
    }

    pub async fn update(&self, update: ProgressUpdate) {
        if let Err(e) = self.store.update_record(self.record_id, update).await {
            warn!(record_id = %self.record_id, error = %e, "Failed to update progress record");
        }
    }
}
