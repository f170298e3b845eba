//! relaydock server
//!
//! Relays browser WebSocket clients to local assistant CLI backends, either
//! structured chat subprocesses or interactive terminals.

mod config;
mod logging;
mod paths;
mod registry;
mod route_actor;
mod router;
mod state;
mod websocket;

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use relaydock_supervisor::AssistantCli;

use crate::config::Config;
use crate::paths::DataPaths;
use crate::state::AppState;
use crate::websocket::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let paths = DataPaths::resolve(config.data_dir.as_deref())?;
    paths.ensure_dirs()?;
    let logging = logging::init_logging(&paths, config.log_stderr)?;

    let launcher = AssistantCli::resolve(config.claude_bin.as_deref(), config.shell.as_deref());
    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths.root().display(),
        assistant = %launcher.program(),
        shell = %launcher.shell(),
        max_processes = config.max_processes,
        max_terminals = config.max_terminals,
        "Starting relaydock server"
    );

    let state = Arc::new(AppState::new(Arc::new(launcher), &config));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state.clone());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %addr,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown();
    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(
        component = "server",
        event = "server.shutdown.signal",
        "Shutdown signal received"
    );
}
