#![forbid(unsafe_code)]

//! `worker-dispatch` — per-project worker supervisor binary.
//!
//! Loads configuration, starts the project settings hot-reload watcher, and
//! runs the dispatch loop until SIGINT/SIGTERM, then stops every worker.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use worker_dispatch::config::GlobalConfig;
use worker_dispatch::config_watcher::ConfigWatcher;
use worker_dispatch::dispatch::file_source::JsonFileWorkSource;
use worker_dispatch::dispatch::{DispatchLoop, DispatchSettings};
use worker_dispatch::models::session::ShutdownReport;
use worker_dispatch::orchestrator::supervisor::{SessionSupervisor, SupervisorConfig};
use worker_dispatch::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "worker-dispatch", about = "Per-project worker supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override `dispatch.work_file`.
    #[arg(long)]
    work_file: Option<PathBuf>,

    /// Run a single dispatch cycle, stop all workers, and exit.
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("worker-dispatch bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(path = %args.config.display(), projects = config.projects.len(), "configuration loaded");

    let work_file = args
        .work_file
        .or_else(|| config.dispatch.work_file.clone())
        .ok_or_else(|| {
            AppError::Config("dispatch.work_file is not set and --work-file was not given".into())
        })?;

    // Keep the watcher alive for the whole run; fall back to a static table.
    let (_watcher, projects) = match ConfigWatcher::new(&args.config, config.project_table()) {
        Ok(watcher) => {
            let table = watcher.table();
            (Some(watcher), table)
        }
        Err(err) => {
            warn!(%err, "project hot-reload unavailable");
            (None, Arc::new(RwLock::new(config.project_table())))
        }
    };

    let supervisor = SessionSupervisor::new(SupervisorConfig::from_global(&config))?;
    let mut dispatch = DispatchLoop::new(
        supervisor,
        Box::new(JsonFileWorkSource::new(work_file)),
        projects,
        DispatchSettings::from_global(&config),
    );

    if args.once {
        match dispatch.run_cycle().await {
            Ok(report) => info!(
                items = report.items.len(),
                prompted = report.prompted(),
                "single cycle complete"
            ),
            Err(err) => error!(%err, "dispatch cycle failed"),
        }
        log_shutdown(&dispatch.supervisor_mut().shutdown("single cycle finished").await);
        return Ok(());
    }

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    let reports = dispatch.run(ct).await;
    log_shutdown(&reports);
    info!("worker-dispatch shut down");
    Ok(())
}

fn log_shutdown(reports: &[ShutdownReport]) {
    for report in reports {
        match &report.error {
            Some(err) => warn!(
                session = report.name,
                killed = report.killed,
                %err,
                "worker stopped after failed abort"
            ),
            None => info!(
                session = report.name,
                aborted = report.aborted,
                killed = report.killed,
                "worker stopped"
            ),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
