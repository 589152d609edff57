use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use capsync_core::app::{CaptureEngine, EngineBuilder, SyncOutcome};
use capsync_core::config::EngineConfig;
use capsync_core::domain::{AssignId, Blob, CaptureId, CaptureStatus, SyncEvent, TaskId};
use capsync_core::impls::{HttpUploadClient, TcpNetworkMonitor, SqliteCaptureStore};

/// Config file looked up in the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "capsync.toml";

#[derive(Debug, Parser)]
#[command(name = "capsync", version, about = "Offline capture queue and uploader")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path from the config.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log filter, e.g. `info` or `capsync_core=debug`. Defaults to RUST_LOG, then `info`.
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database and run one retention sweep.
    Init,

    /// Queue a file as a capture.
    Capture {
        #[arg(long)]
        task: String,
        #[arg(long)]
        assign: String,
        #[arg(long)]
        file: PathBuf,
        /// Stage tag, `after` when omitted.
        #[arg(long)]
        stage: Option<String>,
        /// MIME type; guessed from the file extension when omitted.
        #[arg(long)]
        mime: Option<String>,
    },

    /// Print queued captures as JSON lines.
    List {
        #[arg(long)]
        task: Option<String>,
        /// pending | syncing | failed
        #[arg(long)]
        status: Option<CaptureStatus>,
    },

    /// Print queue totals and sync state.
    Status,

    /// Drain the queue once.
    Sync,

    /// Reset every failed capture and drain.
    Retry,

    /// Delete captures older than the retention window.
    Purge {
        /// Override `storage.retention_days`.
        #[arg(long)]
        days: Option<u32>,
    },

    /// Delete one capture or every capture of a task.
    Discard {
        #[arg(long, conflicts_with = "task", required_unless_present = "task")]
        id: Option<CaptureId>,
        #[arg(long)]
        task: Option<String>,
    },

    /// Delete every queued capture.
    Clear {
        /// Required; there is no undo.
        #[arg(long)]
        yes: bool,
    },

    /// Auto-sync and sweep until Ctrl-C.
    Run,

    /// Write a config file with every default filled in.
    ConfigInit {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter {directives:?}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Command::ConfigInit { path, force } = &cli.command {
        return config_init(path, *force);
    }

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }

    let (engine, monitor) = build_engine(&config).await?;
    engine
        .initialize()
        .await
        .with_context(|| format!("open {}", config.storage.db_path.display()))?;

    match cli.command {
        Command::Init => {
            println!("initialized {}", config.storage.db_path.display());
        }
        Command::Capture {
            task,
            assign,
            file,
            stage,
            mime,
        } => {
            let data = std::fs::read(&file).with_context(|| format!("read {}", file.display()))?;
            let mime = mime.unwrap_or_else(|| guess_mime(&file).to_string());
            // drain inline so the upload finishes before the process exits
            let (id, report) = engine
                .capture_and_sync(
                    TaskId::new(task),
                    AssignId::new(assign),
                    Blob::new(data, mime),
                    stage.as_deref(),
                )
                .await
                .context("capture refused")?;
            println!("{id}");
            match report {
                Some(report) => {
                    info!(success = report.success, failed = report.failed, "sync after capture");
                }
                None => info!("offline; capture queued"),
            }
        }
        Command::List { task, status } => {
            let captures = match (task, status) {
                (Some(task), status) => engine
                    .task_captures(&TaskId::new(task))
                    .await?
                    .into_iter()
                    .filter(|c| status.is_none_or(|s| c.status == s))
                    .collect(),
                (None, Some(status)) => engine.captures_with_status(status).await?,
                (None, None) => {
                    let mut all = Vec::new();
                    for status in [
                        CaptureStatus::Pending,
                        CaptureStatus::Syncing,
                        CaptureStatus::Failed,
                    ] {
                        all.extend(engine.captures_with_status(status).await?);
                    }
                    all
                }
            };
            for capture in captures {
                println!("{}", serde_json::to_string(&capture)?);
            }
        }
        Command::Status => {
            let status = engine.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Sync => print_outcome(engine.sync_now().await),
        Command::Retry => print_outcome(engine.retry_failed().await?),
        Command::Purge { days } => {
            let purged = engine.purge(days).await?;
            println!("purged {purged}");
        }
        Command::Discard { id, task } => {
            if let Some(id) = id {
                if !engine.discard(id).await? {
                    bail!("no capture {id}");
                }
                println!("discarded {id}");
            } else if let Some(task) = task {
                let removed = engine.discard_task(&TaskId::new(task)).await?;
                println!("discarded {removed}");
            }
        }
        Command::Clear { yes } => {
            if !yes {
                bail!("refusing to clear without --yes");
            }
            engine.clear().await?;
            println!("cleared");
        }
        Command::Run => run(&engine).await?,
        // handled before the engine is built
        Command::ConfigInit { .. } => {}
    }

    drop(monitor);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = path {
        return EngineConfig::load_from(path).context("load config");
    }
    let fallback = Path::new(DEFAULT_CONFIG_FILE);
    if fallback.exists() {
        info!(path = %fallback.display(), "using config file");
        return EngineConfig::load_from(fallback).context("load config");
    }
    Ok(EngineConfig::default())
}

fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    EngineConfig::default()
        .save_to(path)
        .context("write config")?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn build_engine(config: &EngineConfig) -> Result<(CaptureEngine, Arc<TcpNetworkMonitor>)> {
    let store = SqliteCaptureStore::open(&config.storage.db_path, config.store_limits());
    let uploader = HttpUploadClient::from_parts(
        &config.upload.base_url,
        &config.upload.path,
        config.upload_timeout(),
    )
    .context("build upload client")?;
    let monitor = TcpNetworkMonitor::for_url(
        &config.upload.base_url,
        config.check_interval(),
        Duration::from_secs(3),
    )
    .map(Arc::new)
    .with_context(|| format!("upload.base_url {:?} has no host", config.upload.base_url))?;
    monitor.check_now().await;

    let engine = EngineBuilder::new()
        .store(Arc::new(store))
        .uploader(Arc::new(uploader))
        .network(monitor.clone())
        .config(config)
        .build()
        .context("wire engine")?;
    Ok((engine, monitor))
}

async fn run(engine: &CaptureEngine) -> Result<()> {
    engine.notifier().subscribe(|event| match event {
        SyncEvent::SyncCompleted { success, failed } => {
            info!(success, failed, "sync completed");
        }
        SyncEvent::SyncError { message } => warn!(%message, "sync error"),
        other => info!(event = other.kind(), "event"),
    });

    engine.start_auto_sync();
    let sweep = engine.spawn_retention_sweep();
    info!("running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;

    info!("shutting down");
    engine.stop_auto_sync();
    sweep.shutdown_and_join().await;
    Ok(())
}

fn print_outcome(outcome: SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(report) => {
            println!("uploaded {} failed {}", report.success, report.failed);
        }
        SyncOutcome::Offline => println!("offline; nothing sent"),
    }
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("webm") => "video/webm",
        Some("mp4") => "video/mp4",
        _ => "image/jpeg",
    }
}
