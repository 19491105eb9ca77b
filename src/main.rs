//! telemon daemon - Main Entry Point
//!
//! Usage: `telemon [config.toml] [points.txt]`
//!
//! Without arguments the configuration is read from the platform data
//! directory, and the definitions file named there is loaded.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use telemon::{
    archive::MemoryArchive,
    collector::{spawn_ingest, TimerDriver},
    config::{default_config_path, LoggingConfig},
    Engine, EngineConfig,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Set up console logging, plus a daily log file when a directory is configured
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "telemon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from).or_else(default_config_path);
    let points_arg = args.next().map(PathBuf::from);

    let config = match &config_path {
        Some(path) if path.exists() => EngineConfig::load(path)
            .with_context(|| format!("loading configuration {:?}", path))?,
        _ => EngineConfig::default(),
    };

    // Held until exit so buffered log lines are flushed
    let _log_guard = init_logging(&config.logging);
    tracing::info!("Starting telemon");

    let engine = Engine::new(config.clone());
    engine.set_archive(Arc::new(MemoryArchive::new(config.archive.max_records)));

    match points_arg.or_else(|| config.points.definitions.clone()) {
        Some(path) => {
            let report = engine
                .load_file(&path)
                .with_context(|| format!("loading point definitions {:?}", path))?;
            if !report.is_clean() {
                tracing::warn!("{} definition problem(s) in {:?}", report.errors.len(), path);
            }
        }
        None => tracing::warn!("No point definitions configured"),
    }
    engine.mark_points_created();

    let running = Arc::new(AtomicBool::new(true));
    let ingest = spawn_ingest(engine.clone(), running.clone()).context("starting ingest thread")?;
    let writer = engine
        .spawn_archive_writer(running.clone())
        .context("starting archive writer")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .enable_io()
        .build()
        .context("building async runtime")?;

    let stop = running.clone();
    runtime.spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                stop.store(false, Ordering::SeqCst);
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
    });
    runtime.block_on(TimerDriver::new(engine.clone(), running.clone()).run_async());

    tracing::info!("Shutting down...");
    running.store(false, Ordering::SeqCst);
    if ingest.join().is_err() {
        tracing::error!("Ingest thread panicked");
    }
    if let Some(writer) = writer {
        if writer.join().is_err() {
            tracing::error!("Archive writer panicked");
        }
    }
    engine.flush_archive();

    Ok(())
}
