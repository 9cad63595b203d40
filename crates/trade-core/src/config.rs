//! Configuration management for the trade-lifecycle manager.

use std::env;
use std::time::Duration;

use crate::{Error, Result};

/// Application configuration, loaded from process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared-store base URL.
    pub supabase_url: String,
    /// Shared-store API key.
    pub supabase_key: String,
    /// Broker REST base URL, e.g. `https://paper-api.alpaca.markets`.
    pub alpaca_base: String,
    pub alpaca_key: String,
    pub alpaca_secret: String,
    /// Sleep between full loop passes.
    pub interval: Duration,
    /// Pre-lock claims allowed per row before a soft-failing submission is
    /// frozen like a fatal one.
    pub max_send_attempts: i64,
    /// Run the broker push-stream listener alongside the reconciler.
    pub trade_events_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            supabase_url: require("SUPABASE_URL")?,
            supabase_key: require("SUPABASE_KEY")?,
            alpaca_base: require("ALPACA_BASE")?,
            alpaca_key: require("ALPACA_KEY")?,
            alpaca_secret: require("ALPACA_SECRET")?,
            interval: Duration::from_secs_f64(
                env::var("TRADE_MANAGER_INTERVAL")
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|secs| *secs > 0.0)
                    .unwrap_or(1.0),
            ),
            max_send_attempts: env::var("TRADE_MANAGER_MAX_SEND_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            trade_events_enabled: env::var("TRADE_EVENTS_ENABLED")
                .map(|s| !matches!(s.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(true),
        })
    }
}

fn require(name: &str) -> Result<String> {
    env::var(name)
        .map_err(|_| Error::Config(format!("{name} environment variable not set")))
}
