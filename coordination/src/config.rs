//! Gateway configuration
//!
//! Built from defaults, then an optional TOML file, then `GATEWAY_*`
//! environment variables. The binary applies CLI overrides last and calls
//! [`GatewayConfig::validate`] before constructing the coordinator.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cache::DEFAULT_CAPACITY;

/// Cluster identifiers, in assignment order.
pub const IDENTIFIER_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Default push endpoint for panic notifications.
pub const DEFAULT_PANIC_URL: &str = "https://api.pushed.co/1/push";

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },

    #[error("Cluster count must be between 1 and {max}, got {got}")]
    ClusterCount { got: usize, max: usize },

    #[error("At least one authorization token is required")]
    NoTokens,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Credentials for the push-notification service used on panics.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PanicConfig {
    #[serde(default = "default_panic_url")]
    pub url: String,
    pub app_key: String,
    pub app_secret: String,
    pub access_token: String,
}

fn default_panic_url() -> String {
    DEFAULT_PANIC_URL.to_string()
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Size of the cluster pool
    pub clusters: usize,
    /// Shards owned by each cluster
    pub shards: u32,
    /// Allow-listed identify tokens
    pub tokens: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_grace_secs: u64,
    /// Capacity of each dedupe scope
    pub dedupe_capacity: usize,
    /// Directory for crash reports sent by clusters
    pub crash_dir: PathBuf,
    /// Host name advertised in the hello payload
    pub host_name: String,
    /// Panic notification credentials; logged only when absent
    pub panic: Option<PanicConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 9000)),
            clusters: 1,
            shards: 1,
            tokens: Vec::new(),
            heartbeat_interval_secs: 30,
            heartbeat_grace_secs: 5,
            dedupe_capacity: DEFAULT_CAPACITY,
            crash_dir: PathBuf::from("."),
            host_name: local_host_name(),
            panic: None,
        }
    }
}

impl GatewayConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `GATEWAY_*` environment variables on top of the current values.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_vars(|var| std::env::var(var).ok())
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(v) = lookup("GATEWAY_BIND") {
            self.bind = parse_var("GATEWAY_BIND", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_CLUSTERS") {
            self.clusters = parse_var("GATEWAY_CLUSTERS", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_SHARDS") {
            self.shards = parse_var("GATEWAY_SHARDS", &v)?;
        }
        if let Some(v) = lookup("GATEWAY_TOKENS") {
            self.tokens = v
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("GATEWAY_CRASH_DIR") {
            self.crash_dir = PathBuf::from(v);
        }

        let panic_key = lookup("GATEWAY_PANIC_APP_KEY");
        let panic_secret = lookup("GATEWAY_PANIC_APP_SECRET");
        let panic_token = lookup("GATEWAY_PANIC_ACCESS_TOKEN");
        if let (Some(app_key), Some(app_secret), Some(access_token)) =
            (panic_key, panic_secret, panic_token)
        {
            self.panic = Some(PanicConfig {
                url: lookup("GATEWAY_PANIC_URL").unwrap_or_else(default_panic_url),
                app_key,
                app_secret,
                access_token,
            });
        } else if let (Some(url), Some(panic)) = (lookup("GATEWAY_PANIC_URL"), &mut self.panic) {
            panic.url = url;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let max = IDENTIFIER_ALPHABET.len();
        if self.clusters == 0 || self.clusters > max {
            return Err(ConfigError::ClusterCount {
                got: self.clusters,
                max,
            });
        }
        if self.tokens.is_empty() {
            return Err(ConfigError::NoTokens);
        }
        if self.shards == 0 {
            return Err(ConfigError::Zero("shards"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Zero("heartbeat_interval_secs"));
        }
        if self.dedupe_capacity == 0 {
            return Err(ConfigError::Zero("dedupe_capacity"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_grace_secs)
    }

    /// The identifiers available to this pool: the first `clusters` letters.
    pub fn identifiers(&self) -> impl Iterator<Item = char> + '_ {
        IDENTIFIER_ALPHABET.chars().take(self.clusters)
    }

    pub fn is_authorized(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}

fn parse_var<T: std::str::FromStr>(var: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
