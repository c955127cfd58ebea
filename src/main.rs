#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # podrelay
//!
//! Session manager for Kubernetes port-forwards and pod log streams.
//!
//! ## Subcommands
//!
//! - `podrelay serve` (default) — run the HTTP/WS server
//! - `podrelay check-config` — print the effective configuration and exit
//!
//! ## API surface
//!
//! | Method | Path                                   | Description                      |
//! |--------|----------------------------------------|----------------------------------|
//! | GET    | `/api/health`                          | Liveness probe, session counts   |
//! | POST   | `/api/portforward/start`               | Open a port-forward              |
//! | GET    | `/api/portforward/check/{port}`        | Local port availability          |
//! | GET    | `/api/portforward/sessions`            | List port-forwards               |
//! | POST   | `/api/portforward/stop/{id}`           | Stop a port-forward              |
//! | GET    | `/api/logs/stream/{namespace}/{pod}`   | WebSocket log stream             |
//! | GET    | `/api/logs/streams`                    | List log streams                 |
//! | DELETE | `/api/logs/stream/{id}`                | Stop a log stream                |
//! | GET    | `/api/logs/stream/{id}/recent`         | Buffered lines of a log stream   |
//! | GET    | `/api/sessions`                        | List every session               |
//! | GET    | `/api/sessions/{id}`                   | One session                      |
//! | DELETE | `/api/sessions/{id}`                   | Stop and forget a session        |
//! | GET    | `/api/events`                          | SSE feed of session events       |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! state.rs         — AppState shared by every handler
//! supervisor.rs    — periodic sweep (lost pods, dead tasks, retention)
//! sessions/        — registry, session records, task handles
//! portforward/     — TCP listeners and byte relays
//! logs/            — log stream loop and ring buffer
//! target/          — pod probe / connect / logs via the Kubernetes API
//! routes/          — REST + SSE handlers, router
//! ws/              — WebSocket log transport
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use podrelay::config::Config;
use podrelay::supervisor::SessionSupervisor;
use podrelay::target::cluster::KubeResolver;
use podrelay::{routes, AppState};

/// Kubernetes port-forward and log-stream session manager.
#[derive(Parser)]
#[command(name = "podrelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Print the effective configuration (file + env overrides) and exit.
    CheckConfig {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckConfig { config }) => {
            let config = Config::load(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("podrelay v{} starting", env!("CARGO_PKG_VERSION"));

    let resolver = KubeResolver::new(
        config.kube.kubeconfig.as_deref().map(Path::new),
        config.kube.context.as_deref(),
    )
    .await
    .context("failed to build Kubernetes client")?;

    let state = AppState::new(config, Arc::new(resolver));
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", state.config.server.listen))?;
    info!("Listening on {}", state.config.server.listen);

    // Periodic sweep: lost pods, dead relay tasks, expired records
    let supervisor = SessionSupervisor::new(
        state.registry.clone(),
        Arc::clone(&state.resolver),
        state.config.supervisor.clone(),
        state.session_events.clone(),
    )
    .spawn(state.shutdown.clone());

    info!("Server ready");

    // Cancelling the token ends open SSE streams, which graceful shutdown
    // would otherwise wait on.
    let shutdown = state.shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await;

    info!("Shutting down...");
    state.shutdown.cancel();
    let _ = supervisor.await;
    state.registry.shutdown_all().await;
    served.context("server error")?;
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
