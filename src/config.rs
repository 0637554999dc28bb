//! Configuration for the uplink client
//!
//! The client takes a plain config struct so the host application decides
//! where values come from. `from_env()` covers the common case of pointing
//! a deployment at a different gateway without a rebuild.

use std::time::Duration;

use crate::error::{Result, UplinkError};

/// Default gateway endpoint when `GAME_WS_URL` is not set.
pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:8080/ws";

/// Environment variable overriding the gateway endpoint.
pub const GATEWAY_URL_ENV: &str = "GAME_WS_URL";

/// Configuration for the uplink client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway WebSocket URL
    pub url: String,
    /// Base delay for exponential reconnect backoff
    pub reconnect_base: Duration,
    /// Upper bound on the reconnect delay
    pub reconnect_cap: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            reconnect_base: Duration::from_millis(1000),
            reconnect_cap: Duration::from_millis(10_000),
        }
    }
}

impl ClientConfig {
    /// Build a config for an explicit endpoint, keeping default backoff tuning.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read the endpoint from `GAME_WS_URL`, falling back to the default.
    pub fn from_env() -> Self {
        let url =
            std::env::var(GATEWAY_URL_ENV).unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string());
        Self::new(url)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if the endpoint is not a WebSocket URL.
    pub fn validate(&self) -> Result<()> {
        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(UplinkError::Config(format!(
                "gateway URL must use ws:// or wss://, got: {}",
                self.url
            )));
        }
        if self.reconnect_base.is_zero() {
            return Err(UplinkError::Config(
                "reconnect base delay must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
