//! modelmux - transparent model switching for local inference servers
//!
//! This binary manages a fleet of inference backends (llama-server, vLLM,
//! ...) behind one OpenAI-compatible endpoint, starting them lazily and
//! swapping them in and out so that only a bounded set holds GPU memory.

use anyhow::{Context, Result};
use clap::Parser;
use modelmux::{Config, ProcessManager};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "modelmux")]
#[command(about = "Transparent model switching for local inference servers")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Backend process output is logged under the "backend" target at debug
    // level, so it can be enabled with e.g. RUST_LOG=info,backend=debug.
    let filter = if args.verbose {
        EnvFilter::new("modelmux=debug,tower_http=debug,backend=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting modelmux");

    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    info!(
        models = ?config.models.keys().collect::<Vec<_>>(),
        groups = ?config.group_ids(),
        listen = %config.listen,
        "Configuration loaded"
    );

    // Serve Prometheus metrics on a separate port if enabled.
    if config.metrics_port > 0
        && let Some(handle) = modelmux::telemetry::install()
    {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
        let metrics_router = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        info!(addr = %metrics_addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    let preload = config.hooks.on_startup.preload.clone();
    let listen = config.listen.clone();

    let (app, manager) = modelmux::build_app(config)
        .await
        .context("Failed to build application")?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;

    info!(addr = %listen, "Listening for requests");

    // Warm configured models once the listener is up.
    if !preload.is_empty() {
        let manager = manager.clone();
        tokio::spawn(async move {
            for model in preload {
                info!(model = %model, "Preloading");
                if let Err(e) = manager.swap(&model).await {
                    warn!(model = %model, error = %e, "Preload failed");
                }
            }
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGINT/SIGTERM after stopping every backend. A second signal
/// during shutdown exits immediately with code 1.
async fn shutdown_signal(manager: ProcessManager) {
    wait_for_signal().await;
    info!("Signal received, shutting down");

    tokio::spawn(async {
        wait_for_signal().await;
        error!("Second signal received, exiting immediately");
        std::process::exit(1);
    });

    manager.shutdown_all().await;
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
