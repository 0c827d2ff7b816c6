//! Failed-job listing and history cleanup

use anyhow::Result;
use clap::Args;
use comfy_table::Cell;
use std::time::Duration;

use super::{new_table, Context};

#[derive(Args)]
pub struct FailedArgs {
    /// Maximum number of jobs to show
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Print the raw JSON document
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct CleanArgs {
    /// Keep jobs that finished within this many hours
    #[arg(long, default_value_t = 24)]
    older_than_hours: u64,
}

pub async fn failed(ctx: Context, args: FailedArgs) -> Result<()> {
    let manager = ctx.manager().await?;
    super::warn_if_ephemeral(&manager);
    let jobs = manager.list_failed(args.limit).await?;
    manager.close().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        crate::print_info("No failed jobs");
        return Ok(());
    }

    let mut table = new_table();
    table.set_header(vec!["Id", "Type", "Attempts", "Error", "Failed at"]);
    for job in &jobs {
        let error = job
            .error
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| job.failed_reason.clone())
            .unwrap_or_default();
        let finished = job
            .finished_on
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&job.id),
            Cell::new(&job.job_type),
            Cell::new(format!("{}/{}", job.attempts, job.max_attempts)),
            Cell::new(error),
            Cell::new(finished),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn clean(ctx: Context, args: CleanArgs) -> Result<()> {
    let manager = ctx.manager().await?;
    let grace = Duration::from_secs(args.older_than_hours * 60 * 60);
    let report = manager.clean(grace).await?;
    manager.close().await?;

    crate::print_success(&format!(
        "Removed {} completed and {} failed jobs",
        report.completed, report.failed
    ));
    Ok(())
}
