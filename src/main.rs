use anyhow::Context;
use archive_uploader::services::lock::LockManager;
use archive_uploader::services::progress;
use archive_uploader::{ArchiveConfig, ArchiveSync, JobParams, ProgressEvent};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "archive-uploader", version, about = "Upload new and changed dataset files to the archive")]
struct Cli {
    /// JSON file of job parameters: a flat task map, or {"task": {..}, "manager": {..}}
    #[arg(long, global = true)]
    params: Option<PathBuf>,

    /// Task parameter override, e.g. --param Dataset_ID=998877
    #[arg(long = "param", value_parser = parse_key_value, global = true)]
    task: Vec<(String, String)>,

    /// Manager parameter override, e.g. --manager perspective=client
    #[arg(long = "manager", value_parser = parse_key_value, global = true)]
    manager: Vec<(String, String)>,

    /// Use the development preset instead of the environment
    #[arg(long, global = true)]
    dev: bool,

    /// Treat archive paths differing only in case as different files
    #[arg(long, global = true)]
    case_sensitive: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan, compare and upload (default)
    Upload,
    /// Report what would be uploaded without uploading
    Diff,
    /// Check the archive's status page for an earlier submission
    Status { status_uri: String },
    /// Remove lock markers left behind by crashed runs
    CleanLocks {
        #[arg(long, default_value_t = 24)]
        older_than_hours: u64,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

fn load_job(cli: &Cli) -> anyhow::Result<JobParams> {
    let (mut task, mut manager) = match &cli.params {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            if value.get("task").is_some() || value.get("manager").is_some() {
                (string_map(&value["task"]), string_map(&value["manager"]))
            } else {
                (string_map(&value), HashMap::new())
            }
        }
        None => (HashMap::new(), HashMap::new()),
    };
    task.extend(cli.task.iter().cloned());
    manager.extend(cli.manager.iter().cloned());

    Ok(JobParams::from_maps(&task, &manager)?)
}

/// Job hosts write numbers and booleans unquoted; everything is a string here.
fn string_map(value: &serde_json::Value) -> HashMap<String, String> {
    value
        .as_object()
        .map(|object| {
            object
                .iter()
                .map(|(key, v)| {
                    let text = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), text)
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn log_progress(mut rx: UnboundedReceiver<ProgressEvent>) {
    let mut last_logged = -1.0f32;
    while let Some(event) = rx.recv().await {
        // one line per whole percent is plenty for a job log
        if event.percent.floor() > last_logged {
            last_logged = event.percent.floor();
            info!("⏳ {:>3.0}% {:?}: {}", event.percent, event.phase, event.message);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "archive_uploader=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = if cli.dev {
        ArchiveConfig::development()
    } else {
        ArchiveConfig::from_env()
    };

    match cli.command.as_ref().unwrap_or(&Command::Upload) {
        Command::CleanLocks { older_than_hours } => {
            let removed = LockManager::new(&config.lock_dir)
                .remove_stale(Duration::from_secs(older_than_hours * 3600))?;
            info!("🧹 Removed {} stale lock(s) from {}", removed, config.lock_dir.display());
            Ok(())
        }
        Command::Status { status_uri } => {
            let sync = ArchiveSync::over_http(config)?;
            let status = sync.transport().check_status(status_uri).await?;
            info!(
                "📋 {:?} at {:.0}%: {} (transaction {})",
                status.state,
                status.percent,
                status.message,
                status.transaction_id.as_deref().unwrap_or("unknown")
            );
            Ok(())
        }
        Command::Diff => {
            let job = load_job(&cli)?;
            let sync = ArchiveSync::over_http(config)?.ignore_case(!cli.case_sensitive);
            let plan = sync.plan(&job, &progress::ProgressReporter::disabled()).await?;
            for entry in &plan.metadata.file {
                println!("{}\t{}\t{}", entry.sha1_hash, entry.size_in_bytes, entry.path);
            }
            info!(
                "📝 {}: {} new, {} updated, {} bytes",
                job.dataset_key(),
                plan.diff.count_new,
                plan.diff.count_updated,
                plan.diff.total_bytes_to_upload
            );
            Ok(())
        }
        Command::Upload => {
            let job = load_job(&cli)?;
            let sync = ArchiveSync::over_http(config)?.ignore_case(!cli.case_sensitive);
            info!("🚀 Archiving {} (job {})", job.dataset_key(), job.job);

            let (reporter, rx) = progress::channel();
            let logger = tokio::spawn(log_progress(rx));

            // Dropping the run future on a signal releases the dataset lock.
            let outcome = tokio::select! {
                outcome = sync.run(&job, &reporter) => Some(outcome),
                _ = shutdown_signal() => None,
            };
            drop(reporter);

            let Some(outcome) = outcome else {
                logger.abort();
                warn!("🛑 Interrupted before the archive verified {}", job.dataset_key());
                std::process::exit(130);
            };
            let _ = logger.await;

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.succeeded() {
                info!("✅ {} archived", outcome.dataset);
                Ok(())
            } else {
                error!(
                    "❌ {} failed ({:?}): {}",
                    outcome.dataset,
                    outcome.failure_class,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
                if let Some(bundle) = &outcome.retained_bundle {
                    warn!("Bundle kept at {}", bundle.display());
                }
                std::process::exit(1);
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, abandoning upload...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, abandoning upload...");
        },
    }
}
