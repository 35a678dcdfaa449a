//! HTTP + WebSocket surface: a thin axum layer over the engine.
//!
//! Serves a JSON API for game state, bets and wallets, and a `/ws`
//! endpoint that streams `ServerMessage`s. CORS is open for local clients.

pub mod routes;
pub mod ws;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::engine::{BetIntake, RoundEngine, Wallet};
use crate::notify::Notifier;
use crate::storage::Ledger;

/// Shared state accessible by all handlers.
pub struct GameState {
    pub engine: Arc<RoundEngine>,
    pub intake: BetIntake,
    pub wallet: Wallet,
    pub ledger: Arc<dyn Ledger>,
    pub timeout: Duration,
}

impl GameState {
    pub fn new(engine: Arc<RoundEngine>, ledger: Arc<dyn Ledger>, timeout: Duration) -> Self {
        let notifier: Arc<dyn Notifier> = engine.hub().clone();
        Self {
            intake: BetIntake::new(engine.clone(), ledger.clone(), notifier.clone(), timeout),
            wallet: Wallet::new(ledger.clone(), notifier, timeout),
            engine,
            ledger,
            timeout,
        }
    }
}

pub type AppState = Arc<GameState>;

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/game/state", get(routes::get_game_state))
        .route("/api/game/history", get(routes::get_history))
        .route("/api/game/stats", get(routes::get_stats))
        .route("/api/bet", post(routes::place_bet))
        .route("/api/users/:id", get(routes::get_user))
        .route("/api/users/:id/bets", get(routes::get_user_bets))
        .route("/api/users/:id/transactions", get(routes::get_user_transactions))
        .route("/api/users/:id/deposit", post(routes::deposit))
        .route("/api/users/:id/withdraw", post(routes::withdraw))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` flips to true, then drain in-flight requests.
pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!(port, "Game server listening on http://localhost:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Game server error")?;
    info!("Game server stopped");
    Ok(())
}

/// Start the server as a background task.
pub fn spawn_server(state: AppState, port: u16, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = serve(state, port, shutdown).await {
            error!(error = %e, "Game server exited");
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
