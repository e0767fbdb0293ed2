//! Initialize sandforge files in a project directory.
//!
//! This module separates pure logic from IO by accepting closures for
//! filesystem operations, making the core logic easily testable.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the init command, writing the config file and prompt overrides.
pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    info!("Initializing sandforge in {}", cwd.display());

    let files = init_files();

    let results = init_project(
        &files,
        force,
        |path| cwd.join(path).exists(),
        |path| {
            fs::create_dir_all(cwd.join(path))
                .with_context(|| format!("Failed to create directory: {}", path.display()))
        },
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results, &files));

    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

/// File to be written during init.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    /// Already exists and `--force` was not given.
    Skipped,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn init_files() -> Vec<InitFile> {
    vec![
        InitFile {
            path: PathBuf::from(CONFIG_FILE),
            content: templates::SANDFORGE_TOML,
            description: "Pipeline configuration",
        },
        InitFile {
            path: PathBuf::from("prompts/system.md"),
            content: templates::SYSTEM_PROMPT,
            description: "Coding agent system prompt",
        },
        InitFile {
            path: PathBuf::from("prompts/title.md"),
            content: templates::TITLE_PROMPT,
            description: "Fragment title prompt",
        },
        InitFile {
            path: PathBuf::from("prompts/response.md"),
            content: templates::RESPONSE_PROMPT,
            description: "Closing message prompt",
        },
    ]
}

/// Core init logic: decides which files to write and writes them.
///
/// `exists` is checked before writing, so an overwrite is reported as such.
fn init_project<E, D, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    create_dir: D,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    D: Fn(&Path) -> Result<()>,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let mut dirs: Vec<&Path> = files
        .iter()
        .filter_map(|f| f.path.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .collect();
    dirs.dedup();
    for dir in dirs {
        create_dir(dir)?;
    }

    let mut results = Vec::with_capacity(files.len());
    for file in files {
        let existed = exists(&file.path);
        let result = match (existed, force) {
            (true, false) => WriteResult::Skipped,
            (true, true) => {
                write_file(&file.path, file.content)?;
                WriteResult::Overwritten
            }
            (false, _) => {
                write_file(&file.path, file.content)?;
                WriteResult::Created
            }
        };
        results.push((file.path.clone(), result));
    }

    Ok(results)
}

/// Formats init results for display with colored output.
fn format_results(results: &[(PathBuf, WriteResult)], files: &[InitFile]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "\n{} sandforge initialized\n", "✓".green().bold());
    let _ = writeln!(out, "Files:");

    for (path, result) in results {
        let desc = files
            .iter()
            .find(|f| &f.path == path)
            .map_or("", |f| f.description);

        let _ = match result {
            WriteResult::Created => {
                writeln!(out, "  {} - {desc}", path.display().to_string().cyan())
            }
            WriteResult::Overwritten => {
                writeln!(out, "  {} {} (overwritten)", "↻".blue(), path.display())
            }
            WriteResult::Skipped => writeln!(
                out,
                "  {} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                path.display()
            ),
        };
    }

    let _ = writeln!(out, "\n{}", "Next steps:".yellow().bold());
    let _ = writeln!(
        out,
        "  1. Edit {} to pick a model provider and sandbox backend",
        CONFIG_FILE.cyan()
    );
    let _ = writeln!(
        out,
        "  2. Export {} and {}",
        "GEMINI_API_KEY".cyan(),
        "E2B_API_KEY".cyan()
    );
    let _ = writeln!(
        out,
        "  3. Run {}",
        "sandforge run --user me --thread demo \"build a counter button\"".green()
    );

    out
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
