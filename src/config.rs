//! Configuration loading and types for S3Dir.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file
//! deserialized into [`Config`], then `S3DIR_*` environment variables, then
//! command-line flags (applied by the binary).  [`Config::validate`] runs
//! last and rejects combinations the server cannot start with.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Object storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Presigned URL settings.
    #[serde(default)]
    pub presign: PresignConfig,

    /// Multipart upload housekeeping.
    #[serde(default)]
    pub multipart: MultipartConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Region to present (e.g. `us-east-1`).
    #[serde(default = "default_region")]
    pub region: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum object size in bytes (default 5 GiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,

    /// Reject every mutating request with `AccessDenied`.
    #[serde(default)]
    pub read_only: bool,

    /// Log every request at info level.
    #[serde(default)]
    pub verbose: bool,

    /// Answer CORS preflight requests and add CORS headers.
    #[serde(default = "default_true")]
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            shutdown_timeout: default_shutdown_timeout(),
            max_object_size: default_max_object_size(),
            read_only: false,
            verbose: false,
            cors: true,
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Verify SigV4 signatures on every request.
    #[serde(default)]
    pub enabled: bool,

    /// Access key (also accepts `access_key_id`).
    #[serde(alias = "access_key_id", default)]
    pub access_key: String,

    /// Secret access key (also accepts `secret_access_key`).
    #[serde(alias = "secret_access_key", default)]
    pub secret_key: String,
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `local` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Root directory for the `local` backend.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            data_dir: default_data_dir(),
        }
    }
}

/// Presigned URL configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresignConfig {
    /// HMAC secret. Falls back to `auth.secret_key`, then to a random
    /// per-process secret.
    #[serde(default)]
    pub secret: Option<String>,

    /// Expiry used when a request does not name one, in seconds.
    #[serde(default = "default_presign_expires")]
    pub default_expires: u64,
}

impl Default for PresignConfig {
    fn default() -> Self {
        Self {
            secret: None,
            default_expires: default_presign_expires(),
        }
    }
}

/// Multipart upload housekeeping.
#[derive(Debug, Clone, Deserialize)]
pub struct MultipartConfig {
    /// Uploads idle for longer than this many seconds are aborted.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// How often the reaper runs, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the `/health` probe.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_presign_expires() -> u64 {
    3600
}

fn default_stale_after() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60 * 60
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_object_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

impl Config {
    /// Apply `S3DIR_*` overrides read through `lookup` (usually
    /// `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("S3DIR_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("S3DIR_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("S3DIR_PORT is not a valid port: {port}"))?;
        }
        if let Some(dir) = lookup("S3DIR_DATA_DIR") {
            self.storage.data_dir = dir;
        }
        if let Some(key) = lookup("S3DIR_ACCESS_KEY_ID") {
            self.auth.access_key = key;
        }
        if let Some(secret) = lookup("S3DIR_SECRET_ACCESS_KEY") {
            self.auth.secret_key = secret;
        }
        if let Some(flag) = lookup("S3DIR_ENABLE_AUTH") {
            self.auth.enabled = parse_bool("S3DIR_ENABLE_AUTH", &flag)?;
        }
        if let Some(flag) = lookup("S3DIR_READ_ONLY") {
            self.server.read_only = parse_bool("S3DIR_READ_ONLY", &flag)?;
        }
        if let Some(flag) = lookup("S3DIR_VERBOSE") {
            self.server.verbose = parse_bool("S3DIR_VERBOSE", &flag)?;
        }
        if let Some(secret) = lookup("S3DIR_PRESIGN_SECRET") {
            self.presign.secret = Some(secret);
        }
        Ok(())
    }

    /// Check that the configuration describes a server that can start.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be between 1 and 65535");
        }
        if self.storage.data_dir.trim().is_empty() && self.storage.backend == "local" {
            anyhow::bail!("storage.data_dir must not be empty");
        }
        if !matches!(self.storage.backend.as_str(), "local" | "memory") {
            anyhow::bail!(
                "storage.backend must be 'local' or 'memory', got '{}'",
                self.storage.backend
            );
        }
        if self.auth.enabled {
            if self.auth.access_key.is_empty() {
                anyhow::bail!("an access key is required when authentication is enabled");
            }
            if self.auth.secret_key.is_empty() {
                anyhow::bail!("a secret key is required when authentication is enabled");
            }
        }
        if self.multipart.sweep_interval_secs == 0 {
            anyhow::bail!("multipart.sweep_interval_secs must be positive");
        }
        Ok(())
    }

    /// The secret used to sign presigned grants, if one is configured.
    pub fn presign_secret(&self) -> Option<&str> {
        self.presign
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| Some(self.auth.secret_key.as_str()).filter(|s| !s.is_empty()))
    }
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{name} is not a boolean: {other}"),
    }
}
