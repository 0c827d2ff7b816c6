//! Submit a file for conversion

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use convq_queue::JobOptions;
use convq_worker::{ConversionPayload, StagingArea, MPP_TO_XML};

use super::Context;

#[derive(Args)]
pub struct SubmitArgs {
    /// File to convert
    file: PathBuf,

    /// Job type
    #[arg(long, default_value = MPP_TO_XML)]
    job_type: String,

    /// Submitting user
    #[arg(long, default_value = "anonymous")]
    user: String,

    /// Higher runs first
    #[arg(long)]
    priority: Option<i32>,

    /// Attempts before the job is failed for good
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Delay before the first attempt, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,
}

pub async fn run(ctx: Context, args: SubmitArgs) -> Result<()> {
    let metadata = tokio::fs::metadata(&args.file)
        .await
        .with_context(|| format!("cannot read {}", args.file.display()))?;

    let staging = StagingArea::new(&ctx.worker.upload_dir);
    staging
        .ensure_dirs()
        .await
        .context("failed to create upload directories")?;
    let filename = staging
        .intake(&args.file)
        .await
        .with_context(|| format!("failed to accept {}", args.file.display()))?;

    let payload = ConversionPayload {
        filename: filename.clone(),
        original_name: args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
        user_id: Some(args.user),
        size: Some(metadata.len()),
        uploaded_at: Some(Utc::now()),
    };

    let mut options = JobOptions::default();
    if let Some(priority) = args.priority {
        options = options.with_priority(priority);
    }
    if let Some(attempts) = args.max_attempts {
        options = options.with_max_attempts(attempts);
    }
    if let Some(ms) = args.delay_ms {
        options = options.with_delay(Duration::from_millis(ms));
    }

    let manager = ctx.manager().await?;
    super::warn_if_ephemeral(&manager);
    let id = manager
        .add_job(&args.job_type, serde_json::to_value(&payload)?, options)
        .await?;
    manager.close().await?;

    crate::print_success(&format!("Queued {} as job {}", filename, id));
    println!("{id}");
    Ok(())
}
