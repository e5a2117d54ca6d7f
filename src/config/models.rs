//! Configuration data structures.
//!
//! These map directly to YAML (also JSON / TOML / INI) configuration files.
//! Every field has a default so an empty file is a valid configuration.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    core::negotiate::{DEFAULT_MAX_DECOMPRESSED_SIZE, DEFAULT_MIN_COMPRESS_SIZE},
    utils::graceful_shutdown::DEFAULT_SHUTDOWN_TIMEOUT,
};

/// Logging output configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `httplog=debug,info`
    pub level: String,
    /// JSON output when true, pretty console output otherwise
    pub json: bool,
    /// Include span context in JSON output
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            include_spans: false,
        }
    }
}

/// Server configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the demo server binds to
    pub listen_addr: String,
    /// Drain deadline in seconds; 0 means the default of 30
    pub shutdown_timeout_secs: u64,
    /// Pretty-print JSON response bodies
    pub json_indented: bool,
    /// Disable on-the-fly gzip; pre-gzipped bodies are still decompressed
    /// for clients that do not accept gzip
    pub disable_compression: bool,
    /// Smallest body, in bytes, that is compressed on the fly
    pub min_compress_size: usize,
    /// Ceiling, in bytes, when inflating a pre-gzipped body for a client
    /// that does not accept gzip; larger bodies fail with a 500
    pub max_decompressed_size: usize,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
            json_indented: false,
            disable_compression: false,
            min_compress_size: DEFAULT_MIN_COMPRESS_SIZE,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Effective drain deadline.
    pub fn shutdown_timeout(&self) -> Duration {
        match self.shutdown_timeout_secs {
            0 => DEFAULT_SHUTDOWN_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }
}
