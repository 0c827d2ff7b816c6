//! Worker process

use anyhow::{bail, Context as _, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use convq_queue::{JobOptions, MetricsSink, QueueManager, QueueMetrics, QueueMonitor};
use convq_worker::{
    CommandConverter, ConversionPayload, ConversionProcessor, ConverterRegistry, StagingArea,
    WorkerConfig, MPP_TO_XML,
};

use super::Context;

#[derive(Args)]
pub struct RunArgs {
    /// Converter executable
    #[arg(long, env = "CONVERTER_PROGRAM")]
    program: String,

    /// Converter argument, repeatable; `{input}` and `{output}` are replaced with file paths
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    converter_args: Vec<String>,

    /// Job type the converter handles
    #[arg(long, default_value = MPP_TO_XML)]
    job_type: String,

    /// Accepted input extension
    #[arg(long, default_value = "mpp")]
    input_ext: String,

    /// Extension of the converted file
    #[arg(long, default_value = "xml")]
    output_ext: String,

    /// Per-job conversion limit in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Seconds between health samples
    #[arg(long, default_value_t = 30)]
    monitor_interval: u64,

    /// Files to submit once the worker is up
    files: Vec<PathBuf>,
}

pub async fn run(ctx: Context, args: RunArgs) -> Result<()> {
    if args.program.trim().is_empty() {
        bail!("converter program is empty");
    }
    let converter = Arc::new(CommandConverter::new(
        &args.program,
        args.converter_args.iter().cloned(),
    ));
    let registry = ConverterRegistry::new().with_route(
        &args.job_type,
        &args.input_ext,
        &args.output_ext,
        converter,
    );

    let mut worker_config = ctx.worker.clone();
    if let Some(ms) = args.timeout_ms.filter(|ms| *ms > 0) {
        worker_config = worker_config.with_timeout(Duration::from_millis(ms));
    }

    let job_types = registry.job_types().collect::<Vec<_>>().join(", ");
    let processor = ConversionProcessor::new(&worker_config, registry);
    processor
        .staging()
        .ensure_dirs()
        .await
        .context("failed to create upload directories")?;
    info!(
        upload_dir = %processor.staging().root().display(),
        job_types = %job_types,
        "Conversion worker ready"
    );

    let metrics = Arc::new(QueueMetrics::new());
    let manager = Arc::new(QueueManager::with_metrics(
        ctx.queue.clone(),
        metrics.clone() as Arc<dyn MetricsSink>,
    ));
    let backend = manager.init().await?.kind();
    manager.register_worker(Arc::new(processor)).await?;

    crate::print_success(&format!(
        "Worker running on the {} backend (queue {}, handling {})",
        backend,
        manager.config().name,
        job_types
    ));

    submit_files(&manager, &worker_config, &args.job_type, &args.files).await?;

    let monitor = QueueMonitor::spawn(
        manager.clone(),
        metrics.clone() as Arc<dyn MetricsSink>,
        Duration::from_secs(args.monitor_interval.max(1)),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    monitor.stop().await;
    if let Err(e) = manager.close().await {
        warn!(error = %e, "Queue did not close cleanly");
    }

    let snapshot = metrics.snapshot();
    crate::print_info(&format!(
        "Completed {}, failed {}, retried {} (failure rate {:.1}%)",
        snapshot.jobs_completed,
        snapshot.jobs_failed,
        snapshot.jobs_retried,
        metrics.failure_rate() * 100.0
    ));
    Ok(())
}

async fn submit_files(
    manager: &QueueManager,
    config: &WorkerConfig,
    job_type: &str,
    files: &[PathBuf],
) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    let staging = StagingArea::new(&config.upload_dir);
    for file in files {
        let filename = staging
            .intake(file)
            .await
            .with_context(|| format!("failed to accept {}", file.display()))?;
        let mut payload = ConversionPayload::new(filename);
        payload.original_name = file.file_name().map(|n| n.to_string_lossy().into_owned());
        let id = manager
            .add_job(job_type, serde_json::to_value(payload)?, JobOptions::default())
            .await?;
        crate::print_info(&format!("Queued {} as job {}", file.display(), id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    #[test]
    fn test_program_path_keeps_spaces() {
        let harness = Harness::try_parse_from([
            "convq",
            "--program",
            "/opt/My Tools/mpp2xml",
            "--arg",
            "--format",
            "--arg",
            "{input}",
            "--arg",
            "{output}",
            "plan.mpp",
        ])
        .unwrap();

        assert_eq!(harness.run.program, "/opt/My Tools/mpp2xml");
        assert_eq!(
            harness.run.converter_args,
            vec!["--format", "{input}", "{output}"]
        );
        assert_eq!(harness.run.files, vec![PathBuf::from("plan.mpp")]);
        assert_eq!(harness.run.job_type, MPP_TO_XML);
    }

    #[test]
    fn test_arguments_are_optional() {
        let harness = Harness::try_parse_from(["convq", "--program", "mpp2xml"]).unwrap();
        assert!(harness.run.converter_args.is_empty());
        assert!(harness.run.files.is_empty());
    }
}
