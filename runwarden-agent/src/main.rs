#![forbid(unsafe_code)]

use clap::Parser;
use runwarden_agent::{
    AgentEvent, EventProcessor, LocalDeploymentLookup, LoggingResultsCleaner,
    LoggingRiskReprocessor, StdoutNotifier,
};
use runwarden_lib::config::{Config, ConfigLoader};
use runwarden_lib::detection::BaselineOnlyEngine;
use runwarden_lib::{Collaborators, Services};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runwarden-agent")]
#[command(about = "Process baseline and runtime alert pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); the standard search path is used when unset
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Newline-delimited JSON events; stdin when unset
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Database path; overrides the configured one
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Log level; overrides the configured one
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let loader = ConfigLoader::new("runwarden-agent");
    let mut config = match &cli.config {
        Some(path) => loader.load_file(path)?,
        None => loader.load()?,
    };
    if let Some(path) = &cli.database {
        config.database.path = Some(path.clone());
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

/// Logs go to stderr; stdout carries alert output only.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_env("RUNWARDEN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config);

    let lookup = Arc::new(LocalDeploymentLookup::new());
    let collaborators = Collaborators {
        policies: Arc::new(
            BaselineOnlyEngine::default()
                .with_max_processes(config.alerts.max_process_violations_per_alert),
        ),
        deployments: lookup.clone(),
        notifier: Arc::new(StdoutNotifier),
        risk: Arc::new(LoggingRiskReprocessor),
        baseline_results: Arc::new(LoggingResultsCleaner),
    };
    let services = Services::from_config(&config, collaborators)?;
    info!(
        database = ?config.database.path,
        read_only = config.database.read_only,
        "runwarden-agent started"
    );

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let pipeline = services.pipeline.clone();
    let flusher = tokio::spawn(async move {
        pipeline
            .run(async move {
                let _ = stop_rx.await;
            })
            .await;
    });

    let mut processor = EventProcessor::new(services.clone(), lookup);
    let consumed = match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            consume(BufReader::new(file), &mut processor).await
        }
        None => consume(BufReader::new(tokio::io::stdin()), &mut processor).await,
    };

    if stop_tx.send(()).is_err() {
        warn!("Flush loop already stopped");
    }
    if let Err(e) = flusher.await {
        error!(error = %e, "Flush loop terminated abnormally");
    }

    let snapshot = services.metrics.snapshot();
    info!(
        indicators_submitted = snapshot.indicators_submitted,
        indicators_flushed = snapshot.indicators_flushed,
        flush_cycles = snapshot.flush_cycles,
        flush_skipped = snapshot.flush_skipped,
        alerts_reconciled = snapshot.alerts_reconciled,
        baselines_created = snapshot.baselines_created,
        enforcement_dispatched = snapshot.enforcement_dispatched,
        avg_flush_duration_ms = snapshot.avg_flush_duration_ms,
        "runwarden-agent shutdown complete"
    );
    consumed.map_err(Into::into)
}

/// Apply events line by line until the input ends or Ctrl-C arrives.
/// Malformed or rejected events are logged and skipped.
async fn consume<R>(reader: R, processor: &mut EventProcessor) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut line_number: u64 = 0;

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received; stopping input");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!(lines = line_number, "Input exhausted");
                    return Ok(());
                };
                line_number = line_number.saturating_add(1);
                if line.trim().is_empty() {
                    continue;
                }
                let result = match AgentEvent::parse(&line) {
                    Ok(event) => processor.handle(event).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(line = line_number, error = %e, "Skipping event");
                }
            }
        }
    }
}
