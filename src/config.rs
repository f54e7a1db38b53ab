//! Runtime configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! command-line flags and environment variables.
//!
//! ```toml
//! server_url = "wss://signaling.example.com:8443"
//! retry_interval_secs = 5
//! robot_name = "arm-01"
//!
//! [tls]
//! insecure = false
//! ca_cert = "/etc/robolink/ca.pem"
//!
//! [pipeline]
//! [[pipeline.ice_servers]]
//! urls = ["stun:stun.l.google.com:19302"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{PipelineError, PipelineSpec};
use crate::signaling::{ConnectOptions, TlsOptions, DEFAULT_CONNECT_TIMEOUT};

/// Signaling server used when nothing else is configured
pub const DEFAULT_SERVER_URL: &str = "wss://application.intuitivemotion.ai:8443";

/// Pause between reconnect attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid signaling server URL: {0}. Must start with ws:// or wss://")]
    InvalidUrl(String),

    #[error("Retry interval must be greater than zero")]
    ZeroRetryInterval,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Everything the supervisor needs to run a session
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub server_url: String,
    /// Fixed delay before every reconnect attempt
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    pub pipeline: PipelineSpec,
    pub tls: TlsOptions,
    /// Name the identity is derived from when none is cached
    pub robot_name: Option<String>,
    /// Give up after this many consecutive failed attempts (None = never)
    pub max_attempts: Option<u32>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pipeline: PipelineSpec::default(),
            tls: TlsOptions::default(),
            robot_name: None,
            max_attempts: None,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(ConfigError::InvalidUrl(self.server_url.clone()));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::ZeroRetryInterval);
        }
        self.pipeline.validate()?;
        Ok(())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            tls: self.tls.clone(),
        }
    }
}

/// Contents of the optional TOML config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub retry_interval_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub robot_name: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub tls: Option<TlsOptions>,
    #[serde(default)]
    pub pipeline: Option<PipelineSpec>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Overlay the values present in the file onto `config`
    pub fn apply(self, config: &mut SupervisorConfig) {
        if let Some(url) = self.server_url {
            config.server_url = url;
        }
        if let Some(secs) = self.retry_interval_secs {
            config.retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(name) = self.robot_name {
            config.robot_name = Some(name);
        }
        if let Some(tls) = self.tls {
            config.tls = tls;
        }
        if let Some(pipeline) = self.pipeline {
            config.pipeline = pipeline;
        }
    }
}
