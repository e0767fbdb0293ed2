//! Formatting functions for command output.
//!
//! Pure functions that return strings; callers print them.

use colored::{ColoredString, Colorize};
use std::fmt::Write;

use crate::store::{MessageStatus, MessageType, ProgressRecord, UserAccount};
use crate::lifecycle::RunReport;

const RULE_WIDTH: usize = 50;

fn rule() -> ColoredString {
    "━".repeat(RULE_WIDTH).dimmed()
}

fn status_label(status: MessageStatus) -> ColoredString {
    match status {
        MessageStatus::Processing => status.as_str().yellow(),
        MessageStatus::Completed => status.as_str().green().bold(),
        MessageStatus::Failed => status.as_str().red().bold(),
    }
}

fn type_label(message_type: MessageType) -> ColoredString {
    match message_type {
        MessageType::Error => message_type.as_str().red(),
        MessageType::Text | MessageType::Result => message_type.as_str().cyan(),
    }
}

/// Summary printed after `sandforge run`.
pub(crate) fn format_report(report: &RunReport) -> String {
    let mut out = String::new();
    let header = if report.is_success() {
        "   ✓ Run Completed".green().bold()
    } else {
        "   ✗ Run Failed".red().bold()
    };

    let _ = writeln!(out, "\n{}", rule());
    let _ = writeln!(out, "{header}");
    let _ = writeln!(out, "{}", rule());
    let _ = writeln!(out, "  Record:     {}", report.record_id.to_string().cyan());
    let _ = writeln!(out, "  Status:     {}", status_label(report.status));
    let _ = writeln!(out, "  Iterations: {}", report.iterations.to_string().cyan());
    let _ = writeln!(
        out,
        "  Stopped:    {}",
        report
            .stop_reason
            .map_or_else(|| "-".to_string(), |r| r.to_string())
            .cyan()
    );
    let _ = writeln!(out, "  Files:      {}", report.file_count.to_string().cyan());
    if let Some(ref error) = report.error {
        let _ = writeln!(out, "  Error:      {}", error.red());
    }
    let _ = writeln!(out, "{}", rule());
    out
}

/// One progress record with its fragment.
pub(crate) fn format_record(record: &ProgressRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} {} {}",
        record.id.to_string().dimmed(),
        record.role.as_str().bold(),
        status_label(record.status),
        type_label(record.message_type)
    );
    let _ = writeln!(out, "  {}", record.content);
    let _ = writeln!(
        out,
        "  {}",
        record
            .updated_at
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string()
            .dimmed()
    );

    if let Some(ref fragment) = record.fragment {
        let _ = writeln!(out, "  Title:   {}", fragment.title.cyan());
        if !fragment.sandbox_id.is_empty() {
            let _ = writeln!(out, "  Sandbox: {}", fragment.sandbox_id.cyan());
        }
        if !fragment.sandbox_url.is_empty() {
            let _ = writeln!(out, "  Preview: {}", fragment.sandbox_url.cyan().underline());
        }
        if !fragment.files.is_empty() {
            let _ = writeln!(out, "  Files:");
            for path in fragment.files.keys() {
                let _ = writeln!(out, "    {path}");
            }
        }
    }
    out
}

pub(crate) fn format_account(user: &UserAccount) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  User:       {}", user.id.cyan());
    let _ = writeln!(out, "  Plan:       {}", user.plan.as_str().cyan());
    let credits = if user.credits > 0 {
        user.credits.to_string().green().bold()
    } else {
        user.credits.to_string().red().bold()
    };
    let _ = writeln!(out, "  Credits:    {credits}");
    let _ = writeln!(out, "  Used today: {}", user.credits_used_today.to_string().cyan());
    let _ = writeln!(
        out,
        "  Refreshed:  {}",
        user.last_credit_refresh
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string()
            .cyan()
    );
    out
}
