//! Configuration loading for crane-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! field has a default, so an empty file (or no file at all) is valid.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for crane-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// WebSocket listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Rendezvous (subscriber waits for a room) configuration.
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    /// Chunked transfer configuration.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Connection limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the WebSocket listener (default: 0.0.0.0:8765).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Rendezvous configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RendezvousConfig {
    /// How long a subscriber may wait for its publisher to open the room
    /// before the connection is closed (default: 60).
    #[serde(default = "default_rendezvous_timeout_secs")]
    pub timeout_secs: u64,
}

/// Chunked transfer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Maximum bytes per `chunk` package the relay emits (default: 512 KiB).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Maximum bytes the relay will reassemble from one chunked payload
    /// (default: 256 MiB).
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

/// Connection limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum new connections per IP address per minute (default: 60).
    #[serde(default = "default_connections_per_ip")]
    pub connections_per_ip: u32,
    /// Maximum concurrent sessions across all rooms (default: 1024).
    /// Connections beyond this are closed immediately.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Serve `/health` and `/metrics` (default: true).
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8765".to_string()
}

fn default_rendezvous_timeout_secs() -> u64 {
    60
}

fn default_max_chunk_size() -> usize {
    crane_types::PACKAGE_MAX_SIZE
}

fn default_max_payload_size() -> usize {
    256 * 1024 * 1024 // 256 MiB
}

fn default_connections_per_ip() -> u32 {
    60
}

fn default_max_concurrent_sessions() -> usize {
    1024
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_http_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_rendezvous_timeout_secs(),
        }
    }
}

impl RendezvousConfig {
    /// The rendezvous timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_ip: default_connections_per_ip(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            enabled: default_http_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or holds
    /// values the relay cannot run with.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make sessions unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.max_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "transfer.max_chunk_size",
                reason: "must be greater than zero".into(),
            });
        }
        if self.transfer.max_payload_size < self.transfer.max_chunk_size {
            return Err(ConfigError::Invalid {
                field: "transfer.max_payload_size",
                reason: "must be at least transfer.max_chunk_size".into(),
            });
        }
        if self.limits.connections_per_ip == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.connections_per_ip",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8765");
        assert_eq!(config.rendezvous.timeout(), Duration::from_secs(60));
        assert_eq!(config.transfer.max_chunk_size, 512 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:9000"

[rendezvous]
timeout_secs = 5

[transfer]
max_chunk_size = 1024

[limits]
connections_per_ip = 5

[http]
bind_address = "0.0.0.0:9090"
enabled = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:9000");
        assert_eq!(config.rendezvous.timeout_secs, 5);
        assert_eq!(config.transfer.max_chunk_size, 1024);
        assert_eq!(config.limits.connections_per_ip, 5);
        assert_eq!(config.http.bind_address, "0.0.0.0:9090");
        assert!(!config.http.enabled);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.rendezvous.timeout_secs, 60);
        assert_eq!(config.transfer.max_payload_size, 256 * 1024 * 1024);
        assert_eq!(config.limits.max_concurrent_sessions, 1024);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let mut config = Config::default();
        config.transfer.max_chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "transfer.max_chunk_size", .. })
        ));
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rendezvous]\ntimeout_secs = 7").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.rendezvous.timeout_secs, 7);
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn from_file_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rendezvous\ntimeout_secs = ").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
