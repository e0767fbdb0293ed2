//! `sandforge worker`: consume trigger events from stdin and run them.
//!
//! Each line is one JSON event. Runs are independent and execute
//! concurrently up to `[run] max_concurrent_runs`.

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::run::record_user_message;
use super::{build_lifecycle, Project};
use crate::config::CreditsConfig;
use crate::credits;
use crate::lifecycle::{RunLifecycle, RunReport, RunRequest};

pub(crate) async fn run() -> Result<()> {
    let project = Project::load()?;
    let store = project.store().await?;
    let worker = Arc::new(Worker {
        lifecycle: build_lifecycle(&project, store)?,
        credits: project.config.credits.clone(),
    });

    let max_concurrent = project.config.run.max_concurrent_runs.max(1);
    info!(max_concurrent, "Worker waiting for events on stdin");

    let summary = process_stream(BufReader::new(tokio::io::stdin()), worker, max_concurrent).await?;
    println!(
        "\n{} {} completed, {} failed, {} rejected",
        "■".dimmed(),
        summary.completed.to_string().green().bold(),
        summary.failed.to_string().red().bold(),
        summary.rejected.to_string().yellow().bold()
    );
    Ok(())
}

struct Worker {
    lifecycle: RunLifecycle,
    credits: CreditsConfig,
}

impl Worker {
    /// Trigger-side checks, then one lifecycle run.
    async fn handle(&self, mut request: RunRequest) -> Result<RunReport> {
        request.validate()?;
        request.ensure_run_id();
        let store = self.lifecycle.store();
        credits::ensure_can_run(store.as_ref(), &request.user_id, &self.credits).await?;
        record_user_message(store.as_ref(), &request).await?;
        self.lifecycle.run(&request).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct WorkerSummary {
    completed: usize,
    failed: usize,
    /// Events that never started a run: bad JSON, validation, credits.
    rejected: usize,
}

fn parse_event(line: &str) -> Result<RunRequest> {
    serde_json::from_str(line).context("Invalid trigger event")
}

async fn process_stream<R>(reader: R, worker: Arc<Worker>, max_concurrent: usize) -> Result<WorkerSummary>
where
    R: AsyncBufRead + Unpin,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut tasks = JoinSet::new();
    let mut summary = WorkerSummary::default();
    let mut lines = reader.lines();
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request = match parse_event(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(line = line_number, error = %format!("{e:#}"), "Skipping event");
                summary.rejected += 1;
                continue;
            }
        };

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("Worker semaphore closed")?;
        let worker = worker.clone();
        tasks.spawn(async move {
            let _permit = permit;
            worker.handle(request).await
        });

        // Collect finished runs without blocking intake
        while let Some(joined) = tasks.try_join_next() {
            tally(&mut summary, joined);
        }
    }

    while let Some(joined) = tasks.join_next().await {
        tally(&mut summary, joined);
    }
    Ok(summary)
}

fn tally(summary: &mut WorkerSummary, joined: Result<Result<RunReport>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(report)) => {
            info!(
                record_id = %report.record_id,
                status = %report.status,
                iterations = report.iterations,
                "Run finished"
            );
            if report.is_success() {
                summary.completed += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(Err(e)) => {
            warn!(error = %format!("{e:#}"), "Event rejected");
            summary.rejected += 1;
        }
        Err(e) => {
            error!(error = %e, "Run task panicked");
            summary.failed += 1;
        }
    }
}
