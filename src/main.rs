//! COLORGAME: Timed color-prediction round server
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the ledger, settles anything left pending by a previous run,
//! then drives the round clock and serves clients until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use colorgame::config::{self, LedgerBackend};
use colorgame::engine::{EngineSettings, RoundEngine};
use colorgame::notify::ConnectionHub;
use colorgame::server::{self, GameState};
use colorgame::storage::{bounded, Ledger, LedgerError, MemoryLedger, SqliteLedger};

const BANNER: &str = r#"
  ____      _              ____
 / ___|___ | | ___  _ __  / ___| __ _ _ __ ___   ___
| |   / _ \| |/ _ \| '__|| |  _ / _` | '_ ` _ \ / _ \
| |__| (_) | | (_) | |   | |_| | (_| | | | | | |  __/
 \____\___/|_|\___/|_|    \____|\__,_|_| |_| |_|\___|

  Timed rounds · atomic settlement · live fan-out
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        window_secs = cfg.game.window_secs,
        tick_interval_ms = cfg.game.tick_interval_ms,
        backend = ?cfg.ledger.backend,
        "COLORGAME starting up"
    );

    // -- Ledger ------------------------------------------------------------

    let ledger: Arc<dyn Ledger> = match cfg.ledger.backend {
        LedgerBackend::Memory => {
            warn!("Using in-memory ledger; nothing survives a restart");
            Arc::new(MemoryLedger::new())
        }
        LedgerBackend::Sqlite => {
            let url = cfg.database_url();
            Arc::new(
                SqliteLedger::connect(&url)
                    .await
                    .with_context(|| format!("Failed to open ledger at {url}"))?,
            )
        }
    };

    seed_demo_user(&cfg, ledger.as_ref()).await?;

    // -- Engine ------------------------------------------------------------

    let hub = Arc::new(ConnectionHub::new(cfg.server.subscriber_buffer));
    let engine = Arc::new(
        RoundEngine::new(EngineSettings::from(&cfg), ledger.clone(), hub)
            .await
            .context("Failed to start round engine")?,
    );

    match engine.reconcile().await {
        Ok(report) if report.periods_examined > 0 => info!(
            periods = report.periods_examined,
            bets = report.bets_settled,
            "Recovered pending bets from previous run"
        ),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Startup reconciliation failed, will retry after next round"),
    }

    // -- Tasks -------------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let clock = tokio::spawn(engine.clone().run(cfg.tick_interval(), shutdown_rx.clone()));

    let server = if cfg.server.enabled {
        let state = Arc::new(GameState::new(engine.clone(), ledger.clone(), cfg.ledger_timeout()));
        Some(server::spawn_server(state, cfg.server.port, shutdown_rx))
    } else {
        info!("HTTP server disabled");
        None
    };

    info!("Entering main loop. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received.");

    let _ = shutdown_tx.send(true);
    clock.await.context("Clock driver task panicked")?;
    if let Some(server) = server {
        server.await.context("Server task panicked")?;
    }

    let snapshot = engine.snapshot().await;
    info!(period = %snapshot.period, "COLORGAME shut down cleanly.");
    Ok(())
}

/// Create the demo account if it does not exist yet.
async fn seed_demo_user(cfg: &config::AppConfig, ledger: &dyn Ledger) -> Result<()> {
    let username = cfg.users.demo_username.as_str();
    if username.is_empty() {
        return Ok(());
    }
    let timeout = cfg.ledger_timeout();
    if let Some(user) = bounded(timeout, ledger.get_user_by_username(username)).await? {
        info!(user_id = user.id, balance = user.balance, "Demo user present");
        return Ok(());
    }
    match bounded(timeout, ledger.create_user(username, cfg.users.initial_balance)).await {
        Ok(user) => info!(user_id = user.id, balance = user.balance, "Demo user created"),
        Err(LedgerError::DuplicateUsername(_)) => {}
        Err(e) => return Err(e).context("Failed to seed demo user"),
    }
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("colorgame=info"));

    let json_logging = std::env::var("COLORGAME_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
