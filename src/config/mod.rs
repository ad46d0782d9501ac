//! Configuration management

use crate::channel::{Endpoint, DEFAULT_PACKET_SIZE, DEFAULT_PIPE_CAPACITY, DEFAULT_WINDOW_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Channel flow control settings
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Local port forwards
    #[serde(default)]
    pub forward: Vec<ForwardConfig>,
    /// Tunnel socket settings
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject values that would only fail later at runtime
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.channel.validate()?;
        for forward in &self.forward {
            forward.listen_addr()?;
            forward.target_endpoint()?;
            if forward.buffer_size == 0 {
                return Err(crate::Error::Config(format!(
                    "Forward {}: buffer_size must be positive",
                    forward.listen
                )));
            }
        }
        self.tunnel.originator_endpoint()?;
        Ok(())
    }
}

/// Flow control settings applied to every channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Initial local window advertised in the open request
    pub window_size: u32,
    /// Largest data payload we accept per message
    pub max_packet_size: u32,
    /// Capacity of the in-process pipe used when no forward target is set
    pub pipe_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_PACKET_SIZE,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

impl ChannelConfig {
    /// Check window and packet sizes
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.window_size == 0 || self.max_packet_size == 0 {
            return Err(crate::Error::Config(
                "window_size and max_packet_size must be positive".to_string(),
            ));
        }
        if self.max_packet_size > self.window_size {
            return Err(crate::Error::Config(format!(
                "max_packet_size {} exceeds window_size {}",
                self.max_packet_size, self.window_size
            )));
        }
        Ok(())
    }
}

/// One local port forward
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Local address to listen on
    pub listen: String,
    /// Remote target reached through the channel (host:port)
    pub target: String,
    /// Channel open timeout in milliseconds (0 waits indefinitely)
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Relay read buffer size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl ForwardConfig {
    /// Create a forward with default timeout and buffer size
    pub fn new(listen: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            target: target.into(),
            open_timeout_ms: default_open_timeout_ms(),
            buffer_size: default_buffer_size(),
        }
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, crate::Error> {
        self.listen
            .parse()
            .map_err(|e| crate::Error::Config(format!("Invalid listen address {}: {}", self.listen, e)))
    }

    /// Parsed target endpoint
    pub fn target_endpoint(&self) -> Result<Endpoint, crate::Error> {
        Endpoint::parse(&self.target)
            .map_err(|e| crate::Error::Config(format!("Invalid target {}: {}", self.target, e)))
    }

    /// Open timeout as a duration (zero means unbounded)
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

fn default_open_timeout_ms() -> u64 {
    5000
}

fn default_buffer_size() -> usize {
    8192
}

/// Tunnel socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Connect timeout in milliseconds (0 waits indefinitely)
    pub connect_timeout_ms: u64,
    /// Originator address reported in open requests
    pub originator: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 0,
            originator: "127.0.0.1:30000".to_string(),
        }
    }
}

impl TunnelConfig {
    /// Parsed originator endpoint
    pub fn originator_endpoint(&self) -> Result<Endpoint, crate::Error> {
        Endpoint::parse(&self.originator).map_err(|e| {
            crate::Error::Config(format!("Invalid originator {}: {}", self.originator, e))
        })
    }

    /// Connect timeout as a duration (zero means unbounded)
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        channel: ChannelConfig::default(),
        forward: vec![ForwardConfig::new("127.0.0.1:2222", "127.0.0.1:22")],
        tunnel: TunnelConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrips_through_toml() {
        let config = generate_example_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        parsed.validate().unwrap();
        assert_eq!(parsed.forward.len(), 1);
        assert_eq!(parsed.forward[0].open_timeout(), Duration::from_secs(5));
        assert_eq!(parsed.channel.window_size, DEFAULT_WINDOW_SIZE);
    }

    #[test]
    fn test_forward_defaults_from_minimal_toml() {
        let parsed: Config = toml::from_str(
            r#"
            [[forward]]
            listen = "127.0.0.1:9000"
            target = "db.internal:5432"
            "#,
        )
        .unwrap();

        parsed.validate().unwrap();
        let forward = &parsed.forward[0];
        assert_eq!(forward.buffer_size, 8192);
        assert_eq!(forward.target_endpoint().unwrap().host(), "db.internal");
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = generate_example_config();
        config.channel.max_packet_size = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        let mut config = generate_example_config();
        config.forward[0].listen = "not an address".to_string();
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        let mut config = generate_example_config();
        config.forward[0].target = "missing-port".to_string();
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("direct-tcpip-{}.toml", std::process::id()));
        let config = generate_example_config();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.forward[0].listen, "127.0.0.1:2222");
        std::fs::remove_file(&path).unwrap();
    }
}
