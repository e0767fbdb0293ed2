use anyhow::{Context, Result};
use colored::Colorize;
use uuid::Uuid;

use super::format::format_record;
use super::Project;

/// What to show: a whole thread or one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StatusTarget {
    Thread(String),
    Record(Uuid),
}

pub(crate) async fn run(target: StatusTarget) -> Result<()> {
    let project = Project::load()?;
    let store = project.store().await?;

    match target {
        StatusTarget::Record(id) => {
            let record = store
                .get_record(id)
                .await
                .with_context(|| format!("Failed to load record {id}"))?;
            match record {
                Some(record) => print!("{}", format_record(&record)),
                None => println!("\n{} No record with id {}.", "ℹ".blue(), id.to_string().cyan()),
            }
        }
        StatusTarget::Thread(thread_id) => {
            let records = store
                .list_records(&thread_id)
                .await
                .with_context(|| format!("Failed to list thread {thread_id}"))?;
            if records.is_empty() {
                println!("\n{} No messages in thread {}.", "ℹ".blue(), thread_id.cyan());
                println!(
                    "  Run {} to start one.",
                    format!("sandforge run --thread {thread_id}").green()
                );
                return Ok(());
            }

            println!("\n{}", "━".repeat(50).dimmed());
            println!("{}", format!("   Thread {thread_id}").yellow().bold());
            println!("{}", "━".repeat(50).dimmed());
            for record in &records {
                print!("{}", format_record(record));
            }
        }
    }

    Ok(())
}
