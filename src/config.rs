use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log verbosity: trace, debug, info, warn or error (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.secret.is_empty() {
            return Err(ConfigError::Invalid("auth.secret must not be empty".into()));
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/', got {:?}",
                self.server.path
            )));
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("server.handshake_timeout_ms must be at least 1".into()));
        }
        if self.broker.max_attempts == 0 {
            return Err(ConfigError::Invalid("broker.max_attempts must be at least 1".into()));
        }
        if self.session.outbound_capacity == 0 || self.session.inbound_capacity == 0 {
            return Err(ConfigError::Invalid("session queue capacities must be at least 1".into()));
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,

    /// WebSocket endpoint path. A trailing slash matches the whole subtree
    /// (default: "/socket/")
    #[serde(default = "default_path")]
    pub path: String,

    /// Serve over TLS when present
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Time a new connection gets to finish the TLS and WebSocket
    /// handshakes (default: 10000)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_path() -> String {
    "/socket/".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            tls: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn path_matches(&self, request_path: &str) -> bool {
        if self.path.ends_with('/') {
            request_path.starts_with(&self.path)
        } else {
            request_path == self.path
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared HMAC secret between the token issuer and the gateway
    #[serde(default)]
    pub secret: String,

    /// Maximum token age in seconds (default: 60)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            window_secs: default_window_secs(),
        }
    }
}

impl AuthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Endpoint of the broker PUB socket we subscribe to
    #[serde(default = "default_sub_endpoint")]
    pub sub_endpoint: String,

    /// Endpoint of the broker REP socket client messages are forwarded to
    #[serde(default = "default_req_endpoint")]
    pub req_endpoint: String,

    /// Subscription filter applied on the SUB socket (default: "" = everything)
    #[serde(default)]
    pub subscribe_filter: String,

    /// Time allowed for one request/reply round trip (default: 5000)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Attempts before a pipeline gives up and reports itself unhealthy (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay, doubled on each further attempt (default: 100)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound for the retry delay (default: 5000)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_sub_endpoint() -> String {
    "tcp://127.0.0.1:5556".to_string()
}

fn default_req_endpoint() -> String {
    "tcp://127.0.0.1:5557".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            sub_endpoint: default_sub_endpoint(),
            req_endpoint: default_req_endpoint(),
            subscribe_filter: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// What the router does when a session's outbound queue is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlowConsumer {
    /// Wait for space, stalling delivery to every other session
    Block,
    /// Evict the session from the room and let it tear down
    #[default]
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Per-session outbound queue capacity (default: 256)
    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,

    /// Capacity of the queue shared by all sessions towards the broker (default: 256)
    #[serde(default = "default_queue_capacity")]
    pub inbound_capacity: usize,

    #[serde(default)]
    pub slow_consumer: SlowConsumer,
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: default_queue_capacity(),
            inbound_capacity: default_queue_capacity(),
            slow_consumer: SlowConsumer::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint; disabled when unset
    #[serde(default)]
    pub listen: Option<String>,
}
