use anyhow::{Context, Result};
use std::time::Duration;

/// Connection settings for the relay client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay feed
    pub relay_url: String,
    /// Fixed delay between a connection ending and the next attempt
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8380/feed".to_string(),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl ClientConfig {
    /// Read configuration from the environment, falling back to defaults
    /// for unset variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let relay_url = std::env::var("FEED_RELAY_URL").unwrap_or(defaults.relay_url);

        let reconnect_delay = match std::env::var("FEED_RECONNECT_SECONDS") {
            Ok(raw) => Duration::from_secs(
                raw.parse()
                    .context("FEED_RECONNECT_SECONDS must be a whole number of seconds")?,
            ),
            Err(_) => defaults.reconnect_delay,
        };

        Ok(Self {
            relay_url,
            reconnect_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.relay_url, "ws://localhost:8380/feed");
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
    }
}
