//! Bus configuration: connect/close options and file/env loading.
//!
//! Options can be built programmatically, deserialized from YAML, or
//! aggregated from a config file plus environment variables.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{BusError, Result};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "interbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "INTERBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "INTERBUS";
/// Environment variable for the handshake trace level.
pub const TRACE_LEVEL_ENV_VAR: &str = "INTERBUS_TRACE_LEVEL";

/// Timeout applied when an operation does not specify one.
pub const DEFAULT_TIMEOUT_MS: i64 = 2000;

/// Normalize an optional timeout: missing means the default, negative means
/// no deadline at all.
pub fn effective_timeout(timeout_ms: Option<i64>) -> i64 {
    timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
}

/// Options for connecting an endpoint to the bus.
///
/// Socket endpoints require exactly one of `path` (Unix domain socket) or
/// `port` (TCP, with `host` defaulting to localhost).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Unix domain socket path.
    pub path: Option<PathBuf>,
    /// TCP port.
    pub port: Option<u16>,
    /// TCP host, defaults to `127.0.0.1`.
    pub host: Option<String>,
    /// Connect deadline in milliseconds; negative disables the deadline.
    pub timeout_delay_ms: Option<i64>,
    /// Human-readable peer name; defaults to the minted peer id.
    pub peer_name: Option<String>,
    /// When set on a bridge, start an embedded broker instead of connecting
    /// to an external one.
    pub server: bool,
}

impl ConnectOptions {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: i64) -> Self {
        self.timeout_delay_ms = Some(timeout_ms);
        self
    }

    pub fn with_server(mut self, server: bool) -> Self {
        self.server = server;
        self
    }

    /// Effective connect timeout in milliseconds.
    pub fn timeout(&self) -> i64 {
        effective_timeout(self.timeout_delay_ms)
    }

    /// Check that exactly one socket endpoint is specified.
    pub fn validate_endpoint(&self) -> Result<()> {
        match (&self.path, self.port) {
            (Some(_), Some(_)) => Err(BusError::Options(
                "both a socket path and a port were given; pick one".to_string(),
            )),
            (None, None) => Err(BusError::Options(
                "a socket path or a port is required".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// TCP address string, only meaningful when `port` is set.
    pub fn tcp_addr(&self) -> String {
        let host = self.host.as_deref().unwrap_or("127.0.0.1");
        format!("{}:{}", host, self.port.unwrap_or(0))
    }
}

/// Options for closing an endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CloseOptions {
    /// Close deadline in milliseconds; negative disables the deadline.
    pub timeout_delay_ms: Option<i64>,
}

impl CloseOptions {
    pub fn with_timeout(mut self, timeout_ms: i64) -> Self {
        self.timeout_delay_ms = Some(timeout_ms);
        self
    }

    /// Effective close timeout in milliseconds.
    pub fn timeout(&self) -> i64 {
        effective_timeout(self.timeout_delay_ms)
    }
}

/// Top-level bus configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Endpoint connection options.
    pub connect: ConnectOptions,
    /// Trace level requested at handshake; zero disables stamping.
    pub trace_level: u8,
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `interbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BusConfig = config.try_deserialize()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| BusError::Options(e.to_string()))
    }
}
