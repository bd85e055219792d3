use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use parley_gateway::HubConfig;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub hub: HubConfig,
}

impl Config {
    /// Read configuration from the environment (after `.env` has been loaded).
    pub fn from_env() -> Result<Self> {
        let jwt_secret = std::env::var("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PARLEY_JWT_SECRET is unset or still a placeholder; it must match the account service's secret");
        }

        let db_path: PathBuf = std::env::var("PARLEY_DB_PATH")
            .unwrap_or_else(|_| "parley.db".into())
            .into();
        let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("PARLEY_PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .context("PARLEY_PORT is not a valid port")?;

        let defaults = HubConfig::default();
        let hub = HubConfig {
            typing_expiry: env_parse("PARLEY_TYPING_EXPIRY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.typing_expiry),
            inbound_queue: env_parse("PARLEY_INBOUND_QUEUE")?
                .map(|n: u64| n.max(1) as usize)
                .unwrap_or(defaults.inbound_queue),
            heartbeat_interval: env_parse("PARLEY_HEARTBEAT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
        };

        Ok(Self {
            jwt_secret,
            db_path,
            host,
            port,
            hub,
        })
    }
}

fn env_parse(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, raw)),
        Err(_) => Ok(None),
    }
}
