use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};
use tagsweep_core::{DebouncePolicy, SchedulerConfig};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Debounce settings for tag invalidation
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    /// Bearer-token gate in front of the purge endpoint
    #[serde(default)]
    pub auth: AuthConfig,
    /// Redis configuration (backends and cross-instance fan-out)
    #[serde(default)]
    pub redis: RedisConfig,
    /// Cache backends swept on every invalidation
    #[serde(default)]
    pub cache: CacheConfig,
}

// Default derived via field defaults

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Invalidation validation
        if self.invalidation.delay_ms == 0 {
            return Err("invalidation.delay_ms must be > 0".into());
        }
        if let Some(max) = self.invalidation.max_delay_ms {
            if max < self.invalidation.delay_ms {
                return Err("invalidation.max_delay_ms must be >= invalidation.delay_ms".into());
            }
        }
        if self.invalidation.report_capacity == 0 {
            return Err("invalidation.report_capacity must be > 0".into());
        }
        // Auth validation
        if self.auth.enabled && self.auth.tokens.iter().all(|t| t.trim().is_empty()) {
            return Err("auth.enabled=true requires at least one auth.tokens entry".into());
        }
        // Backend validation
        if self.cache.cleanup_interval_secs == 0 {
            return Err("cache.cleanup_interval_secs must be > 0".into());
        }
        if self.cache.backends.is_empty() {
            return Err("cache.backends must declare at least one backend".into());
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.cache.backends {
            if backend.name.trim().is_empty() {
                return Err("cache.backends[].name must not be empty".into());
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(format!("duplicate cache backend name '{}'", backend.name));
            }
            if backend.kind == BackendKind::Redis && !self.redis.enabled {
                return Err(format!(
                    "cache backend '{}' is kind=redis but redis.enabled=false",
                    backend.name
                ));
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    64 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Tag invalidation debounce settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// Cache tag invalidation delay in milliseconds (default: 1000)
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Window policy: "fixed" (first request sets the deadline) or
    /// "trailing" (every request pushes it out, bounded by max_delay_ms)
    #[serde(default)]
    pub policy: DebouncePolicy,

    /// Longest a trailing window may stay open.
    /// Defaults to 10x delay_ms.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    /// Buffered sweep reports per subscriber
    #[serde(default = "default_report_capacity")]
    pub report_capacity: usize,
}

fn default_delay_ms() -> u64 {
    tagsweep_core::scheduler::DEFAULT_DELAY_MS
}

fn default_report_capacity() -> usize {
    64
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            policy: DebouncePolicy::default(),
            max_delay_ms: None,
            report_capacity: default_report_capacity(),
        }
    }
}

impl InvalidationConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mut cfg = SchedulerConfig::with_delay(self.delay()).with_policy(self.policy);
        if let Some(max) = self.max_delay_ms {
            cfg = cfg.with_max_delay(Duration::from_millis(max));
        }
        cfg.report_capacity = self.report_capacity;
        cfg
    }
}

/// Authorization for purge requests
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Require a bearer token on purge requests
    /// Default: false
    #[serde(default)]
    pub enabled: bool,

    /// Accepted bearer tokens.
    /// For security, prefer TAGSWEEP__AUTH__TOKENS over the config file.
    #[serde(default)]
    pub tokens: Vec<String>,
}

impl AuthConfig {
    pub fn accepts(&self, token: &str) -> bool {
        !token.is_empty() && self.tokens.iter().any(|t| t == token)
    }
}

/// Redis configuration for shared backends and multi-instance deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Pub/Sub channel used to fan purge requests out to other instances
    #[serde(default = "default_purge_channel")]
    pub purge_channel: String,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_purge_channel() -> String {
    "cache:purge-tags".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            purge_channel: default_purge_channel(),
        }
    }
}

/// Cache backend declarations, swept in the order listed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendConfig>,

    /// How often memory backends drop expired entries nobody read
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_backends() -> Vec<BackendConfig> {
    vec![BackendConfig {
        name: "default".into(),
        kind: BackendKind::Memory,
        prefix: None,
    }]
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default)]
    pub kind: BackendKind,
    /// Key prefix scanned by redis backends (e.g. "pages:")
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process DashMap store
    #[default]
    Memory,
    /// Keys under a prefix in the configured Redis
    Redis,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Redis => write!(f, "redis"),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("tagsweep.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., TAGSWEEP__INVALIDATION__DELAY_MS=2000
        builder = builder.add_source(
            Environment::with_prefix("TAGSWEEP")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("auth.tokens"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }
}
