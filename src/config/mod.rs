//! Configuration
//!
//! TOML-based configuration with three layers: built-in defaults, the config
//! file (with `${VAR}` / `${VAR:-default}` substitution), and `EMBERMQ__`
//! environment variable overrides using double underscores for nesting:
//!
//! - `EMBERMQ__SERVER__PORT=1884` overrides `server.port`
//! - `EMBERMQ__SECURITY__REQUIRE_AUTH=true` overrides `security.require_auth`

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub persistence: PersistenceConfig,
    pub performance: PerformanceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,
    /// MQTT/TCP port
    pub port: u16,
    /// MQTT/WebSocket port (None disables the WebSocket listener)
    pub ws_port: Option<u16>,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Seconds a socket may take to complete CONNECT
    pub keep_alive_timeout: u64,
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1883,
            ws_port: None,
            ws_path: "/mqtt".to_string(),
            max_connections: 100_000,
            keep_alive_timeout: 30,
            max_packet_size: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::Validation(format!("invalid server.host/port: {}", e)))
    }

    pub fn ws_bind_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        match self.ws_port {
            Some(port) => format!("{}:{}", self.host, port)
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::Validation(format!("invalid server.ws_port: {}", e))),
            None => Ok(None),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout)
    }
}

/// Security configuration: TLS and the authentication gate
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Wrap the TCP listener in TLS
    pub enable_tls: bool,
    /// Path to the certificate chain (PEM)
    pub cert_file: String,
    /// Path to the private key (PEM)
    pub key_file: String,
    /// CA certificate for client authentication (optional)
    pub ca_file: Option<String>,
    /// Reject CONNECTs without valid credentials
    pub require_auth: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
}

/// A configured user
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Enable the persistent store
    pub enabled: bool,
    /// Backend kind; only "memory" is built in
    pub storage_type: String,
    /// Maximum retained topics (0 = unbounded)
    pub retained_message_limit: usize,
    /// Persistent session time-to-live while disconnected, in seconds
    pub session_ttl: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage_type: "memory".to_string(),
            retained_message_limit: 10_000,
            session_ttl: 3600,
        }
    }
}

impl PersistenceConfig {
    pub fn session_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.session_ttl)
    }
}

/// Performance tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Per-session offline queue bound (0 = unbounded)
    pub message_queue_limit: usize,
    /// Outbound QoS > 0 inflight window per session
    pub inflight_window: usize,
    /// Bound on the inbound QoS 2 received set per session
    pub max_awaiting_rel: usize,
    /// Tokio worker threads (0 = available parallelism)
    pub worker_threads: usize,
    /// Seconds between retransmission sweeps
    pub retry_interval: u64,
    /// Retransmissions before a delivery is abandoned
    pub max_retries: u32,
    /// Per-connection outbound channel capacity
    pub outbound_channel_capacity: usize,
    /// Seconds between session expiry sweeps
    pub session_expiry_check_interval: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            message_queue_limit: 1000,
            inflight_window: 32,
            max_awaiting_rel: 100,
            worker_threads: 0,
            retry_interval: 5,
            max_retries: 3,
            outbound_channel_capacity: 1024,
            session_expiry_check_interval: 60,
        }
    }
}

impl PerformanceConfig {
    pub fn retry_interval_duration(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    pub fn expiry_check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.session_expiry_check_interval)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 1883)?
            .set_default("server.ws_path", "/mqtt")?
            .set_default("server.max_connections", 100_000)?
            .set_default("server.keep_alive_timeout", 30)?
            .set_default("server.max_packet_size", 1024 * 1024)?
            .set_default("security.enable_tls", false)?
            .set_default("security.require_auth", false)?
            .set_default("persistence.enabled", false)?
            .set_default("persistence.storage_type", "memory")?
            .set_default("persistence.retained_message_limit", 10_000)?
            .set_default("persistence.session_ttl", 3600)?
            .set_default("performance.message_queue_limit", 1000)?
            .set_default("performance.inflight_window", 32)?
            .set_default("performance.max_awaiting_rel", 100)?
            .set_default("performance.worker_threads", 0)?
            .set_default("performance.retry_interval", 5)?
            .set_default("performance.max_retries", 3)?
            .set_default("performance.outbound_channel_capacity", 1024)?
            .set_default("performance.session_expiry_check_interval", 60)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Missing file means defaults only
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment-only configuration (containerized deployments)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (testing; no env overrides)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind_addr()?;
        self.server.ws_bind_addr()?;

        if self.security.enable_tls {
            if self.security.cert_file.is_empty() {
                return Err(ConfigError::Validation(
                    "security.cert_file is required when enable_tls is set".to_string(),
                ));
            }
            if self.security.key_file.is_empty() {
                return Err(ConfigError::Validation(
                    "security.key_file is required when enable_tls is set".to_string(),
                ));
            }
        }

        if self.security.require_auth && self.security.users.is_empty() {
            return Err(ConfigError::Validation(
                "security.require_auth is set but no users are configured".to_string(),
            ));
        }

        for user in &self.security.users {
            if user.username.is_empty() {
                return Err(ConfigError::Validation("empty username".to_string()));
            }
            if user.password.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "user '{}' has empty password",
                    user.username
                )));
            }
        }

        if self.persistence.enabled && self.persistence.storage_type != "memory" {
            return Err(ConfigError::Validation(format!(
                "unknown persistence.storage_type '{}'",
                self.persistence.storage_type
            )));
        }

        Ok(())
    }
}
