//! `sandforge run`: one request, end to end, in the foreground.

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use super::format::format_report;
use super::{build_lifecycle, Project};
use crate::credits;
use crate::lifecycle::{RunReport, RunRequest};
use crate::store::{NewProgressRecord, ProgressStore};

pub(crate) async fn run(
    user_id: String,
    thread_id: String,
    run_id: Option<Uuid>,
    request_text: String,
) -> Result<()> {
    let project = Project::load()?;
    let store = project.store().await?;

    let mut request = RunRequest::new(request_text, thread_id, user_id);
    if let Some(id) = run_id {
        request = request.with_run_id(id);
    }
    request.validate()?;
    request.ensure_run_id();

    let user = credits::ensure_can_run(store.as_ref(), &request.user_id, &project.config.credits).await?;
    info!(user_id = %user.id, credits = user.credits, "Credit check passed");

    record_user_message(store.as_ref(), &request).await?;

    let lifecycle = build_lifecycle(&project, store)?;
    let report = lifecycle.run(&request).await?;
    print!("{}", format_report(&report));
    exit_status(&report)
}

/// Store the user's own message in the thread before the run starts.
///
/// The record id is derived from the run id, so a redelivered event
/// upserts the same message instead of adding another.
pub(crate) async fn record_user_message(store: &dyn ProgressStore, request: &RunRequest) -> Result<()> {
    let run_id = request
        .run_id
        .context("Run id must be assigned before recording the user message")?;
    store
        .create_record(NewProgressRecord::user_message(
            user_message_id(run_id),
            &request.thread_id,
            &request.user_id,
            request.request_text.trim(),
        ))
        .await
        .context("Failed to record user message")?;
    Ok(())
}

fn user_message_id(run_id: Uuid) -> Uuid {
    Uuid::new_v5(&run_id, b"user-message")
}

fn exit_status(report: &RunReport) -> Result<()> {
    if report.is_success() {
        Ok(())
    } else {
        anyhow::bail!("Run {} failed", report.record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, MessageRole, MessageStatus};

    #[tokio::test]
    async fn test_user_message_is_completed_result() {
        let store = InMemoryStore::new();
        let mut request = RunRequest::new("  build a counter button ", "thread-1", "user-1");
        request.ensure_run_id();
        record_user_message(&store, &request).await.unwrap();

        let records = store.list_records("thread-1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].role, MessageRole::User);
        assert_eq!(records[0].status, MessageStatus::Completed);
        assert_eq!(records[0].content, "build a counter button");
        assert!(records[0].fragment.is_none());
    }

    #[tokio::test]
    async fn test_user_message_is_recorded_once_per_run_id() {
        let store = InMemoryStore::new();
        let request = RunRequest::new("build a counter button", "thread-1", "user-1").with_run_id(Uuid::new_v4());
        record_user_message(&store, &request).await.unwrap();
        record_user_message(&store, &request).await.unwrap();

        let records = store.list_records("thread-1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_ne!(records[0].id, request.run_id.unwrap());
    }

    #[tokio::test]
    async fn test_user_message_requires_run_id() {
        let store = InMemoryStore::new();
        let request = RunRequest::new("build a counter button", "thread-1", "user-1");
        assert!(record_user_message(&store, &request).await.is_err());
    }
}
