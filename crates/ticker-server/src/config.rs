//! Configuration for the ticker server.
//!
//! Defaults can be overridden through environment variables:
//!
//! - `TICKER_BIND_ADDR`             (default: "0.0.0.0")
//! - `TICKER_PORT`                  (default: "8080")
//! - `TICKER_MAX_CLIENTS`           (default: "1024")
//! - `TICKER_BROADCAST_INTERVAL_MS` (default: "5000")
//! - `TICKER_WRITE_TIMEOUT_MS`      (default: "2000")
//! - `TICKER_HANDSHAKE_TIMEOUT_MS`  (default: "5000")
//!
//! The binary lets CLI flags override a few of these on top.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// IP address / interface to bind to (e.g. "0.0.0.0" or "127.0.0.1").
    pub bind_addr: String,

    /// TCP port to listen on. `0` picks a free port.
    pub port: u16,

    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,

    /// Period between broadcast ticks.
    pub broadcast_interval: Duration,

    /// Upper bound on a single write to one client.
    pub write_timeout: Duration,

    /// Upper bound on the WebSocket opening handshake.
    pub handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            max_clients: 1024,
            broadcast_interval: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Construct a `Config` from environment variables, falling back
    /// to the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();

        let config = Config {
            bind_addr: lookup("TICKER_BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: parse_or_default(&lookup, "TICKER_PORT", defaults.port)?,
            max_clients: parse_or_default(&lookup, "TICKER_MAX_CLIENTS", defaults.max_clients)?,
            broadcast_interval: millis_or_default(
                &lookup,
                "TICKER_BROADCAST_INTERVAL_MS",
                defaults.broadcast_interval,
            )?,
            write_timeout: millis_or_default(
                &lookup,
                "TICKER_WRITE_TIMEOUT_MS",
                defaults.write_timeout,
            )?,
            handshake_timeout: millis_or_default(
                &lookup,
                "TICKER_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_interval.is_zero() {
            bail!("broadcast interval must be greater than zero");
        }
        if self.write_timeout.is_zero() {
            bail!("write timeout must be greater than zero");
        }
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must be greater than zero");
        }
        Ok(())
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn parse_or_default<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value {:?} for {}", val, key)),
        None => Ok(default),
    }
}

fn millis_or_default(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let default_ms = default.as_millis() as u64;
    parse_or_default(lookup, key, default_ms).map(Duration::from_millis)
}
