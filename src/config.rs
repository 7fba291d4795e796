//! Configuration management for Authguard.
//!
//! Settings are layered: built-in defaults, then an optional file, then
//! `AUTHGUARD_`-prefixed environment variables using `__` between nested
//! keys (e.g. `AUTHGUARD_SERVER__GRPC_ADDR=0.0.0.0:8081`).

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::ratelimit::{FailurePolicy, LimiterOptions, DEFAULT_FAIL_OPEN_MAX_OUTAGE_MS, DEFAULT_SHARD_COUNT};

/// Main configuration for the Authguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthguardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Identifier attached to this process's logs
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            instance_id: default_instance_id(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8081))
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the rate limiter document (JSON, or YAML by extension)
    pub config_path: Option<String>,

    /// Configuration reload interval in seconds, 0 to reload on SIGHUP only
    #[serde(default = "default_reload_interval")]
    pub config_reload_interval_secs: u64,

    /// Idle bucket sweep interval in seconds, 0 to rely on inline eviction only
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Number of lock shards in the bucket store
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Behavior when bucket state cannot be reached
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Longest continuous store outage to admit through under fail-open,
    /// `null` for no limit
    #[serde(default = "default_fail_open_max_outage")]
    pub fail_open_max_outage_ms: Option<u64>,

    /// Upper bound on one bucket store call
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,

    /// Retry hint for requests denied by a store failure
    #[serde(default = "default_store_retry_after")]
    pub store_retry_after_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            config_reload_interval_secs: default_reload_interval(),
            sweep_interval_secs: default_sweep_interval(),
            shard_count: default_shard_count(),
            failure_policy: FailurePolicy::default(),
            fail_open_max_outage_ms: default_fail_open_max_outage(),
            store_timeout_ms: None,
            store_retry_after_ms: default_store_retry_after(),
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_shard_count() -> usize {
    DEFAULT_SHARD_COUNT
}

fn default_fail_open_max_outage() -> Option<u64> {
    Some(DEFAULT_FAIL_OPEN_MAX_OUTAGE_MS)
}

fn default_store_retry_after() -> u64 {
    1000
}

impl RateLimitingConfig {
    /// Store failure options for the decision engine.
    pub fn limiter_options(&self) -> LimiterOptions {
        LimiterOptions {
            failure_policy: self.failure_policy,
            fail_open_max_outage_ms: self.fail_open_max_outage_ms,
            store_timeout: self.store_timeout_ms.map(Duration::from_millis),
            store_retry_after_ms: self.store_retry_after_ms,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AuthguardConfig {
    /// Load settings from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("AUTHGUARD")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load settings from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(Path::new(path)))
    }
}
