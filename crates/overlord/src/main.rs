//! # Overlord
//!
//! A remote-agent coordination hub: accepts persistent TCP connections from
//! ghost-agent endpoints, accepts browser-originated WebSocket/HTTP requests
//! from operators, and brokers interactive sessions between the two sides.
//!
//! ## Architecture
//!
//! ```text
//! Ghost Agent ──TCP──► Agent Session ──┐
//!                                      ├──► Registry ◄──┐
//! Operator  ──WS/HTTP──► Frontend ─────┘                │
//!                                          Monitor Sink ─┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`]  — the process-wide directory and its concurrency discipline
//! - [`agent`]      — Agent Session state machine and splicing
//! - [`frontend`]   — operator-facing HTTP/WebSocket routes
//! - [`monitor`]    — registry-change event fan-out
//! - [`discovery`]  — UDP LAN beacon
//! - [`wire`]       — async framing on top of `overlord_protocol`
//! - [`error`]      — error kinds and their wire-level translation
//! - [`cli`]        — process startup flags

mod agent;
mod cli;
mod discovery;
mod error;
mod frontend;
mod monitor;
mod registry;
mod wire;

use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::frontend::AppState;
use crate::monitor::MonitorSink;
use crate::registry::Registry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overlord=info".into()),
        )
        .init();

    let cli = cli::Cli::parse();

    let app_dir = cli.apps_dir.join(&cli.app);
    if !app_dir.is_dir() {
        error!("App `{}' does not exist at {}", cli.app, app_dir.display());
        std::process::exit(1);
    }

    let monitor = MonitorSink::new();
    let registry = Registry::new(monitor.clone());
    let state = AppState {
        registry: registry.clone(),
        monitor,
    };

    let agent_listener =
        match tokio::net::TcpListener::bind((cli.agent_bind, cli.agent_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "failed to bind agent TCP listener on {}:{}: {e}",
                    cli.agent_bind, cli.agent_port
                );
                std::process::exit(1);
            }
        };
    info!(
        "Overlord started, listening for agents at {}",
        agent_listener.local_addr().expect("bound listener has a local address")
    );

    let agent_registry = registry.clone();
    let agent_task = tokio::spawn(async move {
        loop {
            match agent_listener.accept().await {
                Ok((stream, peer)) => {
                    info!("incoming agent connection from {peer}");
                    let registry = agent_registry.clone();
                    tokio::spawn(async move { agent::run(registry, stream, peer).await });
                }
                Err(e) => warn!("agent accept error: {e}"),
            }
        }
    });

    if cli.no_discovery {
        info!("discovery beacon disabled via --no-discovery");
    } else {
        tokio::spawn(discovery::run(cli.agent_port, cli.discovery_port));
    }

    let stats_registry = registry.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            info!(
                "#Agents, #Slogcat clients: {}, {}",
                stats_registry.agent_count(),
                stats_registry.slogcat_count()
            );
        }
    });

    let app = Router::new()
        .route("/api/pty/{mid}", get(frontend::pty_handler))
        .route("/api/log/{mid}", get(frontend::logcat_handler))
        .route("/api/slog/{mid}/{cid}", get(frontend::slog_handler))
        .route(
            "/api/shell/{mid}",
            get(frontend::shell_get).post(frontend::shell_post),
        )
        .route("/api/agents/list", get(frontend::list_agents))
        .route("/api/slogcats/list", get(frontend::list_slogcats))
        .route("/api/socket.io/{*rest}", get(frontend::monitor_handler))
        .fallback_service(ServeDir::new(app_dir))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(cli.web_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind operator web server on {}: {e}", cli.web_addr);
            agent_task.abort();
            std::process::exit(1);
        }
    };
    info!("Overlord web server listening at {}", cli.web_addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("web server error: {e}");
    }
}
