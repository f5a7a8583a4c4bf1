//! # Configuration Management
//!
//! Centralized configuration for the Aether daemon.
//!
//! This module provides structured configuration for the device-facing TCP server,
//! the wire limits, the local control socket, module resources and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (prefix `AETHER_`)
//!
//! ## Timeouts
//! Nothing in the protocol core times out by default. `module_stop_timeout` is an
//! explicit opt-in bound on the shutdown barrier and stays `None` unless configured.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic value that starts every frame (`0xAA 0x55` on the wire)
pub const MAGIC: u16 = 0xAA55;

/// Max allowed payload size (e.g. 16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default port devices connect to
pub const DEFAULT_PORT: u16 = 9000;

/// Default path of the local control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/aetherd.socket";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AetherConfig {
    /// Device-facing server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Wire limits
    #[serde(default)]
    pub transport: TransportConfig,

    /// Local control socket
    #[serde(default)]
    pub control: ControlConfig,

    /// Module resources
    #[serde(default)]
    pub modules: ModulesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AetherConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load defaults and apply environment variable overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `AETHER_*` environment variables on top of the current values
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("AETHER_SERVER_ADDRESS") {
            self.server.address = addr;
        }

        if let Ok(limit) = std::env::var("AETHER_BACKPRESSURE_LIMIT") {
            self.server.backpressure_limit = parse_env("AETHER_BACKPRESSURE_LIMIT", &limit)?;
        }

        if let Ok(max) = std::env::var("AETHER_MAX_CONNECTIONS") {
            self.server.max_connections = parse_env("AETHER_MAX_CONNECTIONS", &max)?;
        }

        if let Ok(ms) = std::env::var("AETHER_MODULE_STOP_TIMEOUT_MS") {
            let millis: u64 = parse_env("AETHER_MODULE_STOP_TIMEOUT_MS", &ms)?;
            self.server.module_stop_timeout = Some(Duration::from_millis(millis));
        }

        if let Ok(size) = std::env::var("AETHER_MAX_PAYLOAD_SIZE") {
            self.transport.max_payload_size = parse_env("AETHER_MAX_PAYLOAD_SIZE", &size)?;
        }

        if let Ok(path) = std::env::var("AETHER_CONTROL_SOCKET") {
            self.control.socket_path = path;
        }

        if let Ok(size) = std::env::var("AETHER_POOL_SIZE") {
            self.modules.pool_size = parse_env("AETHER_POOL_SIZE", &size)?;
        }

        if let Ok(level) = std::env::var("AETHER_LOG_LEVEL") {
            self.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid AETHER_LOG_LEVEL: {level}"))
            })?;
        }

        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.control.validate());
        errors.extend(self.modules.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {name}: {raw}")))
}

/// Device-facing TCP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:9000")
    pub address: String,

    /// Received chunks queued per connection before the socket stops being read
    pub backpressure_limit: usize,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Size of each socket read
    pub read_buffer_size: usize,

    /// How long a graceful stop waits for connections to drain
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Optional bound on the module shutdown barrier. `None` waits indefinitely.
    #[serde(default, with = "option_duration_serde")]
    pub module_stop_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            backpressure_limit: 32,
            max_connections: 1000,
            read_buffer_size: 1024,
            shutdown_timeout: Duration::from_secs(10),
            module_stop_timeout: None,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:9000')",
                self.address
            ));
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        } else if self.backpressure_limit > 1_000_000 {
            errors.push(format!(
                "Backpressure limit too large: {} (max recommended: 1,000,000)",
                self.backpressure_limit
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.read_buffer_size < 64 {
            errors.push("Read buffer size too small (minimum: 64 bytes)".to_string());
        }

        if self.shutdown_timeout.as_secs() > 300 {
            errors.push("Shutdown timeout too long (maximum: 300s)".to_string());
        }

        if let Some(timeout) = self.module_stop_timeout {
            if timeout.is_zero() {
                errors.push("Module stop timeout must be greater than 0 when set".to_string());
            }
        }

        errors
    }
}

/// Wire limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size > u32::MAX as usize {
            errors.push(format!(
                "Max payload size too large: {} bytes (the length field is 32 bits)",
                self.max_payload_size
            ));
        }

        errors
    }
}

/// Local control socket configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Whether to listen on the control socket
    pub enabled: bool,

    /// Unix socket path
    pub socket_path: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: DEFAULT_CONTROL_SOCKET.to_string(),
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.enabled && self.socket_path.is_empty() {
            errors.push("Control socket path cannot be empty when enabled".to_string());
        }
        errors
    }
}

/// Resources shared by modules
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Number of store handles opened eagerly for the telemetry module
    pub pool_size: usize,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self { pool_size: 5 }
    }
}

impl ModulesConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.pool_size == 0 {
            errors.push("Pool size must be greater than 0".to_string());
        } else if self.pool_size > 1024 {
            errors.push(format!("Pool size too large: {} (maximum: 1024)", self.pool_size));
        }
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("aetherd"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Same as `duration_serde`, for optional values
mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
