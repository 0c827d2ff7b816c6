//! CLI command implementations

pub mod info;
pub mod maintenance;
pub mod run;
pub mod stats;
pub mod status;
pub mod submit;

use anyhow::{Context as _, Result};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Table};

use convq_queue::{BackendKind, QueueConfig, QueueManager};
use convq_worker::WorkerConfig;

use crate::GlobalArgs;

/// Configuration resolved from the environment and global flags
pub struct Context {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
}

impl Context {
    pub fn load(args: &GlobalArgs) -> Result<Self> {
        let mut queue = QueueConfig::from_env().context("invalid queue configuration")?;
        let mut worker = WorkerConfig::from_env().context("invalid worker configuration")?;

        if let Some(name) = &args.queue {
            queue.name = name.clone();
        }
        if let Some(url) = &args.redis_url {
            queue.broker.url = url.clone();
        }
        if args.memory {
            queue.force_memory = true;
        }
        if let Some(dir) = &args.upload_dir {
            worker.upload_dir = dir.clone();
        }

        Ok(Self { queue, worker })
    }

    /// Build a manager and settle its backend
    pub async fn manager(&self) -> Result<QueueManager> {
        let manager = QueueManager::new(self.queue.clone());
        manager.init().await?;
        Ok(manager)
    }
}

/// Commands that only read state are useless against a fresh in-process queue
pub fn warn_if_ephemeral(manager: &QueueManager) {
    if manager.backend_kind() == Some(BackendKind::Memory) {
        crate::print_warning(
            "Using the in-process queue: it only holds jobs submitted by this process",
        );
    }
}

pub fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS);
    table
}

pub fn key_cell(key: &str) -> Cell {
    Cell::new(key.bold())
}
