use serde::Deserialize;

/// Complete Pulse configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PulseConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Listener configuration for the feed socket and status endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Route the feed WebSocket is served on
    #[serde(default = "default_feed_path")]
    pub feed_path: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8380
}

fn default_feed_path() -> String {
    "/feed".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            feed_path: default_feed_path(),
        }
    }
}

/// Relay hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// How many frames a slow peer may fall behind before it skips ahead
    #[serde(default = "default_fan_out_buffer")]
    pub fan_out_buffer: usize,
}

fn default_fan_out_buffer() -> usize {
    256
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fan_out_buffer: default_fan_out_buffer(),
        }
    }
}

/// Downstream HTTP sink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_enabled")]
    pub enabled: bool,
    /// Endpoint that receives a POST copy of every reading
    #[serde(default = "default_sink_url")]
    pub url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_sink_enabled() -> bool {
    true
}

fn default_sink_url() -> String {
    "http://localhost:8000/api/sensor-data/add_data/".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            enabled: default_sink_enabled(),
            url: default_sink_url(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            relay: RelayConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<PulseConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: PulseConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PulseConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8380);
        assert_eq!(config.server.feed_path, "/feed");
        assert_eq!(config.relay.fan_out_buffer, 256);
        assert_eq!(config.sink.enabled, true);
        assert_eq!(config.sink.request_timeout_seconds, 10);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            feed_path = "/ws"

            [relay]
            fan_out_buffer = 64

            [sink]
            enabled = false
            url = "http://sink.internal/readings"
            request_timeout_seconds = 3
        "#;

        let config: PulseConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.feed_path, "/ws");
        assert_eq!(config.relay.fan_out_buffer, 64);
        assert_eq!(config.sink.enabled, false);
        assert_eq!(config.sink.url, "http://sink.internal/readings");
    }

    #[test]
    fn test_partial_config() {
        // Missing sections and fields use defaults
        let toml = r#"
            [server]
            port = 8500
        "#;

        let config: PulseConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8500);
        assert_eq!(config.server.host, "0.0.0.0"); // Default
        assert_eq!(config.sink.enabled, true); // Default
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sink]\nenabled = false").unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.sink.enabled, false);
        assert_eq!(config.server.port, 8380); // Default

        assert!(load_config("/nonexistent/pulse.toml").is_err());
    }
}
