//! Job status lookup

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::Cell;

use convq_queue::{JobLookup, JobSnapshot, JobState};

use super::{key_cell, new_table, Context};

#[derive(Args)]
pub struct StatusArgs {
    /// Job id
    id: String,

    /// Print the raw JSON document
    #[arg(long)]
    json: bool,
}

pub async fn run(ctx: Context, args: StatusArgs) -> Result<()> {
    let manager = ctx.manager().await?;
    super::warn_if_ephemeral(&manager);
    let lookup = manager.get_job_status(&args.id).await?;
    manager.close().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&lookup)?);
        return Ok(());
    }

    match lookup {
        JobLookup::NotFound => {
            crate::print_warning(&format!("Job {} not found", args.id));
        }
        JobLookup::Found(job) => print_job(&job),
    }
    Ok(())
}

fn print_job(job: &JobSnapshot) {
    let mut table = new_table();
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec![key_cell("Id"), Cell::new(&job.id)]);
    table.add_row(vec![key_cell("Type"), Cell::new(&job.job_type)]);
    table.add_row(vec![key_cell("Status"), Cell::new(colored_state(job.status))]);
    table.add_row(vec![key_cell("Progress"), Cell::new(format!("{}%", job.progress))]);
    table.add_row(vec![
        key_cell("Attempts"),
        Cell::new(format!("{}/{}", job.attempts, job.max_attempts)),
    ]);
    table.add_row(vec![key_cell("Priority"), Cell::new(job.priority)]);
    table.add_row(vec![key_cell("Backend"), Cell::new(job.backend)]);
    table.add_row(vec![key_cell("Created"), Cell::new(job.created_at.to_rfc3339())]);
    if let Some(finished) = job.finished_on {
        table.add_row(vec![key_cell("Finished"), Cell::new(finished.to_rfc3339())]);
    }
    if let Some(error) = &job.error {
        table.add_row(vec![key_cell("Error"), Cell::new(error.to_string().red())]);
    }
    if let Some(result) = &job.result {
        table.add_row(vec![key_cell("Result"), Cell::new(result)]);
    }
    println!("{table}");
}

pub fn colored_state(state: JobState) -> String {
    let label = state.as_str();
    match state {
        JobState::Completed => label.green().to_string(),
        JobState::Failed => label.red().to_string(),
        JobState::Processing => label.cyan().to_string(),
        _ => label.yellow().to_string(),
    }
}
