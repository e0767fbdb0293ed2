//! sandforge: turns a natural-language feature request into a runnable
//! project inside a remote sandbox, tracking progress in a store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

mod agent;
mod commands;
mod config;
mod credits;
mod detection;
mod lifecycle;
mod network;
mod sandbox;
mod state;
mod store;
mod templates;
mod tools;

use config::{Config, LoggingConfig};
use store::Plan;

#[derive(Parser)]
#[command(name = "sandforge")]
#[command(
    author,
    version,
    about = "Agent pipeline that builds runnable projects in remote sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write sandforge.toml and prompt files to the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Run one request end to end
    Run {
        /// User the run is charged to
        #[arg(long)]
        user: String,

        /// Thread the run belongs to
        #[arg(long)]
        thread: String,

        /// Stable run id; reusing one makes the run idempotent
        #[arg(long)]
        run_id: Option<Uuid>,

        /// What to build
        request: String,
    },

    /// Run trigger events read as JSON lines from stdin
    Worker,

    /// Show progress records for a thread or a single record
    Status {
        /// Thread id
        #[arg(long, conflicts_with = "record", required_unless_present = "record")]
        thread: Option<String>,

        /// Record id
        #[arg(long)]
        record: Option<Uuid>,
    },

    /// Inspect or adjust credit balances
    Credits {
        #[command(subcommand)]
        action: CreditsAction,
    },
}

#[derive(Subcommand)]
enum CreditsAction {
    /// Show a user's balance
    Show {
        #[arg(long)]
        user: String,
    },

    /// Set a user's balance, creating the user if needed
    Set {
        #[arg(long)]
        user: String,

        #[arg(long)]
        amount: i64,

        /// FREE, PRO or PREMIUM
        #[arg(long)]
        plan: Option<Plan>,
    },
}

/// Install the subscriber. The returned guard flushes the log file on drop.
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let default = if verbose { "sandforge=debug" } else { "sandforge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let console = if logging.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file, guard) = match logging.directory {
        Some(ref directory) => {
            let appender = tracing_appender::rolling::daily(directory, "sandforge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config errors are reported by the command itself
    let logging = std::env::current_dir()
        .ok()
        .and_then(|dir| Config::load(&dir).ok())
        .map(|config| config.logging)
        .unwrap_or_default();
    let _guard = init_logging(cli.verbose, &logging);

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Run {
            user,
            thread,
            run_id,
            request,
        } => {
            commands::run::run(user, thread, run_id, request).await?;
        }
        Commands::Worker => {
            commands::worker::run().await?;
        }
        Commands::Status { thread, record } => {
            let target = match (record, thread) {
                (Some(id), _) => commands::status::StatusTarget::Record(id),
                (None, Some(thread)) => commands::status::StatusTarget::Thread(thread),
                (None, None) => anyhow::bail!("Pass --thread or --record"),
            };
            commands::status::run(target).await?;
        }
        Commands::Credits { action } => match action {
            CreditsAction::Show { user } => commands::credits::show(&user).await?,
            CreditsAction::Set { user, amount, plan } => {
                commands::credits::set(&user, amount, plan).await?;
            }
        },
    }

    Ok(())
}
