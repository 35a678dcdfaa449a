//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section and field has a default, so a partial file (or none of a
//! section) is fine. The database URL may be overridden by an env var
//! named in the config and resolved at runtime.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub game: GameConfig,
    pub ledger: LedgerConfig,
    pub server: ServerConfig,
    pub users: UsersConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GameConfig {
    /// Betting window length in ticks (seconds at the default cadence).
    pub window_secs: u32,
    pub tick_interval_ms: u64,
    /// Rounds carried in every snapshot.
    pub history_limit: usize,
    /// Attempts to persist a round record before giving up on it.
    pub persist_retries: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            tick_interval_ms: 1_000,
            history_limit: 20,
            persist_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub database_url: String,
    /// Env var that, when set, overrides `database_url`.
    pub database_url_env: Option<String>,
    pub timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Sqlite,
            database_url: "sqlite:colorgame.db".into(),
            database_url_env: None,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
    pub subscriber_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 5000,
            subscriber_buffer: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UsersConfig {
    pub initial_balance: i64,
    /// Seeded at startup when missing. Empty disables seeding.
    pub demo_username: String,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            initial_balance: 100,
            demo_username: "demo".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.game.window_secs == 0 {
            bail!("game.window_secs must be at least 1");
        }
        if self.game.tick_interval_ms == 0 {
            bail!("game.tick_interval_ms must be at least 1");
        }
        if self.game.persist_retries == 0 {
            bail!("game.persist_retries must be at least 1");
        }
        if self.ledger.timeout_ms == 0 {
            bail!("ledger.timeout_ms must be at least 1");
        }
        if self.users.initial_balance < 0 {
            bail!("users.initial_balance cannot be negative");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// The database URL, preferring the override env var when it is set.
    pub fn database_url(&self) -> String {
        self.ledger
            .database_url_env
            .as_deref()
            .and_then(|name| Self::resolve_env(name).ok())
            .unwrap_or_else(|| self.ledger.database_url.clone())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.game.tick_interval_ms)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger.timeout_ms)
    }
}
