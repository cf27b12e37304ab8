//! facesync-ds - Device Sync service
//!
//! Keeps facial-recognition access-control terminals in step with the upstream
//! roster. Runs the sync cycle on a fixed cadence (or once with `--once`) and
//! serves a small status API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use facesync_common::config::{locate_config_file, resolve_root_folder, RootLayout, ROOT_FOLDER_ENV};
use facesync_ds::config::SyncConfig;
use facesync_ds::scheduler::{pipeline, RunLock, Scheduler, SyncPipeline, TickOutcome};
use facesync_ds::AppState;

/// Command-line arguments for facesync-ds
#[derive(Parser, Debug)]
#[command(name = "facesync-ds")]
#[command(about = "Device sync engine for face-recognition access terminals")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "FACESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder for registry, photo cache and run lock
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Run a single cycle, print its report and exit
    #[arg(long)]
    once: bool,

    /// Do not start the status API
    #[arg(long)]
    no_http: bool,

    /// Replay the registry into the mirror cache and exit
    #[arg(long)]
    rebuild_mirror: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facesync_ds=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting facesync-ds {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));

    let config_path = locate_config_file(args.config.as_deref())
        .context("No configuration file found (use --config or FACESYNC_CONFIG)")?;
    let config = SyncConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    config.validate().context("Invalid configuration")?;
    info!("Config: {}", config_path.display());

    let root_folder = resolve_root_folder(
        args.root_folder.as_deref(),
        ROOT_FOLDER_ENV,
        config.root_folder.as_deref(),
    );
    let layout = RootLayout::new(root_folder);
    layout
        .ensure_directories()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", layout.root().display());

    let registry = pipeline::build_registry(&config, &layout)?;

    if args.rebuild_mirror {
        let members = pipeline::rebuild_mirrors(&registry, &config.device_targets())
            .await
            .context("Mirror rebuild failed")?;
        info!(devices = config.devices.len(), members, "Mirror rebuilt");
        return Ok(());
    }

    let cycle = SyncPipeline::from_config(&config, &layout, Arc::clone(&registry))?;
    let photo_cache = cycle.photo_cache();
    let scheduler = Arc::new(
        Scheduler::new(
            Arc::new(cycle),
            RunLock::new(layout.lock_path()),
            config.schedule_interval(),
        )
        .with_run_on_start(config.schedule.run_on_start),
    );
    info!(
        devices = config.devices.len(),
        interval_secs = config.schedule.interval_secs,
        "Scheduler configured"
    );

    if args.once {
        return run_once(&scheduler).await;
    }

    let cancel = CancellationToken::new();

    let server = if args.no_http {
        None
    } else {
        let state = AppState::new(Arc::clone(&registry), Some(Arc::clone(&scheduler)))
            .with_photo_cache(photo_cache);
        let app = facesync_ds::build_router(state);
        let listener = tokio::net::TcpListener::bind(&config.http.bind)
            .await
            .with_context(|| format!("Failed to bind to {}", config.http.bind))?;
        info!("Listening on http://{}", config.http.bind);

        let shutdown = cancel.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }))
    };

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    shutdown_signal().await;
    cancel.cancel();

    runner.await.context("Scheduler task failed")?;
    if let Some(server) = server {
        server
            .await
            .context("Server task failed")?
            .context("Server error")?;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn run_once(scheduler: &Scheduler) -> Result<()> {
    match scheduler.run_once().await {
        TickOutcome::Ran(Ok(report)) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.success {
                Ok(())
            } else {
                anyhow::bail!("Sync cycle completed with failures: {}", report.display_string())
            }
        }
        TickOutcome::Ran(Err(e)) => Err(e).context("Sync cycle failed"),
        TickOutcome::SkippedBusy => anyhow::bail!("Another cycle is already running"),
        TickOutcome::SkippedLocked { owner_pid } => {
            anyhow::bail!("Run lock held by process {}", owner_pid)
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current cycle and shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing current cycle and shutting down");
        },
    }
}
