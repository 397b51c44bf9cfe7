//! Binary entry point: CLI parsing, logging bootstrap, configuration
//! loading, and the engine's start/shutdown lifecycle — mirroring the
//! teacher's `main.rs` structure (`init_logging` -> `load_configuration` ->
//! `run_service`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use eventmesh_node::config::NodeConfig;
use eventmesh_node::engine::Engine;
use eventmesh_node::host::NoopHost;
use eventmesh_node::ingress::{router, AppState};
use eventmesh_node::{logging, SERVICE_NAME, VERSION};

#[derive(Parser, Debug)]
#[command(name = "eventmesh-node-server", version)]
struct Cli {
    /// Path to a config file (overrides the default `eventmesh-node.toml` search).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Load configuration, validate it, print the result, and exit.
    #[arg(long)]
    validate_config: bool,

    /// Skip rehydrating pools/state from a persisted snapshot on startup.
    #[arg(long)]
    no_load_state: bool,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = match NodeConfig::load(cli.config.as_ref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    if cli.no_load_state {
        config.load_state = false;
    }

    logging::init(&config.log_level, &config.log_format);

    if cli.validate_config {
        println!("{}", serde_json::to_string_pretty(&config).unwrap());
        return;
    }

    info!(service = SERVICE_NAME, version = VERSION, node = %config.name, "starting");

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run(config: NodeConfig) -> eventmesh_node::error::Result<()> {
    let neighbors = Arc::new(config.discovery_neighbors.clone());
    let bind_addr = format!("{}:{}", config.address, config.port);

    let host = Arc::new(NoopHost);
    let engine = Engine::new(config, host.clone(), host)?;
    engine.load_state().await?;

    let (handles, shutdown_tx) = engine.start();

    let app = router(AppState {
        engine: engine.clone(),
        neighbors,
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| eventmesh_node::error::EngineError::internal(format!("bind {bind_addr}: {e}")))?;
    info!(address = %bind_addr, "listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "HTTP server error");
    }

    engine.request_shutdown().await;
    drop(shutdown_tx);
    for handle in handles {
        let _ = handle.await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or, on Unix, SIGTERM — matching the teacher's
/// `shutdown_signal` in `server.rs`.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
