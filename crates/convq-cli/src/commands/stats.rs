//! Queue statistics

use anyhow::Result;
use clap::Args;
use comfy_table::Cell;

use convq_queue::{monitor, QueueMetrics};

use super::{key_cell, new_table, Context};

#[derive(Args)]
pub struct StatsArgs {
    /// Print the raw JSON document
    #[arg(long, conflicts_with = "prometheus")]
    json: bool,

    /// Print queue depth gauges in Prometheus text format
    #[arg(long)]
    prometheus: bool,
}

pub async fn run(ctx: Context, args: StatsArgs) -> Result<()> {
    let manager = ctx.manager().await?;
    let metrics = QueueMetrics::new();
    let sample = monitor::sample(&manager, &metrics).await?;
    manager.close().await?;

    if args.prometheus {
        print!("{}", metrics.snapshot().to_prometheus());
        return Ok(());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&sample)?);
        return Ok(());
    }

    let stats = &sample.stats;
    let mut table = new_table();
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec![key_cell("Backend"), Cell::new(stats.backend)]);
    table.add_row(vec![key_cell("Waiting"), Cell::new(stats.waiting)]);
    table.add_row(vec![key_cell("Delayed"), Cell::new(stats.delayed)]);
    table.add_row(vec![key_cell("Active"), Cell::new(stats.active)]);
    table.add_row(vec![key_cell("Completed"), Cell::new(stats.completed)]);
    table.add_row(vec![key_cell("Failed"), Cell::new(stats.failed)]);
    table.add_row(vec![key_cell("Total"), Cell::new(stats.total)]);
    table.add_row(vec![
        key_cell("Workers"),
        Cell::new(format!("{}/{}", stats.active_workers, stats.max_workers)),
    ]);
    table.add_row(vec![key_cell("Latency"), Cell::new(format!("{} ms", sample.latency_ms))]);
    println!("{table}");
    Ok(())
}
