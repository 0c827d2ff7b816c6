//! Backend information

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::Cell;

use super::{key_cell, new_table, Context};

#[derive(Args)]
pub struct InfoArgs {
    /// Print the raw JSON document
    #[arg(long)]
    json: bool,
}

pub async fn run(ctx: Context, args: InfoArgs) -> Result<()> {
    let manager = ctx.manager().await?;
    let info = manager.get_info();
    let latency = manager.ping().await;
    manager.close().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let backend = info
        .backend
        .map(|b| b.to_string())
        .unwrap_or_else(|| "unselected".to_string());
    let reachable = match latency {
        Ok(rtt) => format!("{} ({} ms)", "yes".green(), rtt.as_millis()),
        Err(e) => format!("{} ({e})", "no".red()),
    };

    let mut table = new_table();
    table.set_header(vec!["Property", "Value"]);
    table.add_row(vec![key_cell("Queue"), Cell::new(&info.name)]);
    table.add_row(vec![key_cell("Backend"), Cell::new(backend)]);
    table.add_row(vec![key_cell("Ready"), Cell::new(info.ready)]);
    if let Some(url) = &info.broker_url {
        table.add_row(vec![key_cell("Broker"), Cell::new(url)]);
    }
    table.add_row(vec![key_cell("Reachable"), Cell::new(reachable)]);
    println!("{table}");
    Ok(())
}
