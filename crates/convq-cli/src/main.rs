//! convq - command-line interface for the conversion queue
//!
//! # Usage
//!
//! ```bash
//! # Run a worker with an external converter
//! convq run --program mpp2xml --arg {input} --arg {output}
//!
//! # Submit a file for conversion
//! convq submit plan.mpp
//!
//! # Inspect the queue
//! convq status 42
//! convq stats
//! convq stats --prometheus
//! convq failed --limit 10
//! convq info
//! ```

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod commands;

use commands::{info, maintenance, run, stats, status, submit};

/// convq - asynchronous file conversion queue
///
/// Jobs go to Redis when it is reachable and to an in-process queue otherwise.
#[derive(Parser)]
#[command(name = "convq", version, about = "convq - file conversion job queue")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every command. Unset flags fall back to the environment.
#[derive(Args, Clone, Debug)]
pub struct GlobalArgs {
    /// Queue name
    #[arg(long, env = "QUEUE_NAME", global = true)]
    queue: Option<String>,

    /// Redis URL
    #[arg(long, env = "REDIS_URL", global = true)]
    redis_url: Option<String>,

    /// Never try Redis
    #[arg(long, global = true)]
    memory: bool,

    /// Root of the upload directories
    #[arg(long, env = "UPLOAD_DIR", global = true)]
    upload_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a conversion worker until interrupted
    #[command(name = "run")]
    Run(run::RunArgs),

    /// Submit a file for conversion
    #[command(name = "submit")]
    Submit(submit::SubmitArgs),

    /// Show the status of a job
    #[command(name = "status")]
    Status(status::StatusArgs),

    /// Show queue statistics
    #[command(name = "stats")]
    Stats(stats::StatsArgs),

    /// List recently failed jobs
    #[command(name = "failed")]
    Failed(maintenance::FailedArgs),

    /// Remove finished jobs older than a grace period
    #[command(name = "clean")]
    Clean(maintenance::CleanArgs),

    /// Show backend information
    #[command(name = "info")]
    Info(info::InfoArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let ctx = commands::Context::load(&cli.global)?;

    match cli.command {
        Commands::Run(args) => run::run(ctx, args).await,
        Commands::Submit(args) => submit::run(ctx, args).await,
        Commands::Status(args) => status::run(ctx, args).await,
        Commands::Stats(args) => stats::run(ctx, args).await,
        Commands::Failed(args) => maintenance::failed(ctx, args).await,
        Commands::Clean(args) => maintenance::clean(ctx, args).await,
        Commands::Info(args) => info::run(ctx, args).await,
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
