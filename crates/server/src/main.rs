mod cli;
mod mediator;
mod protocol;
mod server;
mod shutdown;
mod tools;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ruvltra_core::{RuvltraConfig, config_path, default_state_dir, load_config};
use ruvltra_engine::{PoolConfig, start_pool};

use crate::cli::Cli;
use crate::shutdown::{ShutdownController, spawn_ctrl_c_handler};

fn init_logging(level: &str) {
    // stdout belongs to the transport; every diagnostic goes to stderr.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(cli: &Cli) -> RuvltraConfig {
    let mut cfg = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(Some(cfg)) => cfg,
            Ok(None) => {
                eprintln!(
                    "warning: config file {} not found; using defaults",
                    path.display()
                );
                RuvltraConfig::default()
            }
            Err(err) => {
                eprintln!("warning: ignoring malformed config file: {err:#}");
                RuvltraConfig::default()
            }
        },
        None => match config_path().and_then(|path| load_config(&path)) {
            Ok(Some(cfg)) => cfg,
            Ok(None) => RuvltraConfig::default(),
            Err(err) => {
                eprintln!("warning: ignoring malformed config file: {err:#}");
                RuvltraConfig::default()
            }
        },
    };

    cli.apply(&mut cfg);
    cfg.clamp();
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = resolve_config(&cli);
    init_logging(&cfg.log_level);

    if cfg.sona_enabled && cfg.sona_state_dir.is_none() {
        match default_state_dir() {
            Ok(dir) => cfg.sona_state_dir = Some(dir),
            Err(err) => {
                tracing::warn!(
                    error = %format!("{err:#}"),
                    "no state directory; memory persistence disabled"
                );
            }
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = cfg.initial_workers,
        http = cfg.http_endpoint.is_some(),
        native = cfg.model_path.is_some(),
        sona = cfg.sona_enabled,
        "starting ruvltra"
    );

    let pool = start_pool(PoolConfig::from_settings(&cfg));

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    tokio::select! {
        res = server::serve(pool.clone()) => {
            if let Err(err) = res {
                tracing::error!(error = %format!("{err:#}"), "transport error");
            }
        }
        _ = shutdown_rx.recv() => {}
    }

    pool.shutdown().await;
    Ok(())
}
