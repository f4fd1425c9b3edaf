#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # gatekeep
//!
//! Remote-access gateway. Browsers open a WebSocket per remote session and
//! gatekeep relays it to guacd, optionally reaching the asset through an SSH
//! access gateway. Other browsers can watch a live session, and any session
//! can be closed from the REST API.
//!
//! ## Subcommands
//!
//! - `gatekeep serve` (default): run the HTTP/WS server
//!
//! ## API surface
//!
//! | Method | Path                                 | Auth    | Description                        |
//! |--------|--------------------------------------|---------|------------------------------------|
//! | GET    | `/api/health`                        | No      | Liveness probe                     |
//! | POST   | `/api/sessions`                      | Yes     | Create a session for an asset      |
//! | GET    | `/api/sessions`                      | Yes     | List sessions (filters, paging)    |
//! | GET    | `/api/sessions/{id}`                 | Yes     | One session                        |
//! | POST   | `/api/sessions/{id}/connect`         | Yes     | Mark connected                     |
//! | POST   | `/api/sessions/{id}/resize`          | Yes     | Record display size                |
//! | POST   | `/api/sessions/{ids}/disconnect`     | Yes     | Force-close sessions               |
//! | DELETE | `/api/sessions/{ids}`                | Yes     | Delete sessions and recordings     |
//! | GET    | `/api/sessions/{id}/recording`       | Yes     | Download a recording               |
//! | GET    | `/api/gateways`                      | Yes     | Access gateway status              |
//! | POST   | `/api/gateways/{id}/reconnect`       | Yes     | Redial an access gateway           |
//! | GET    | `/api/sessions/{id}/tunnel`          | Token*  | Subject WebSocket                  |
//! | GET    | `/api/sessions/{id}/tunnel-monitor`  | Token*  | Observer WebSocket                 |
//!
//! *WebSocket auth is via `?token=<key>` (no `Authorization` header is
//! available during a browser upgrade).

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use gatekeep::sessions::endpoint::CloseCode;
use gatekeep::{AppState, Config};

/// Remote-access gateway for guacd sessions.
#[derive(Parser)]
#[command(name = "gatekeep", version)]
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
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gatekeep: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if let Err(e) = run_server(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(config: Config) -> std::io::Result<()> {
    info!("gatekeep v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("guacd at {}", config.guacd.addr());
    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set GATEKEEP_API_KEY or update config");
    }
    info!(
        assets = config.assets.len(),
        credentials = config.credentials.len(),
        gateways = config.gateways.len(),
        "Records loaded"
    );

    let state = AppState::new(config);
    let app = gatekeep::routes::router(state.clone());
    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    let closed = state
        .registry
        .close_all(CloseCode::Normal, "server shutting down")
        .await;
    info!("Closed {closed} live session(s)");
    state.gateways.shutdown().await;
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
                warn!("Failed to register SIGTERM: {e}");
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
