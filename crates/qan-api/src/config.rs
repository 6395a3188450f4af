//! Configuration types for the QAN API service.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::QanError;

// ============================================================================
// Default configuration constants
// ============================================================================

/// Default native RPC port.
pub const DEFAULT_GRPC_PORT: u16 = 9911;

/// Default HTTP/JSON gateway port.
pub const DEFAULT_JSON_PORT: u16 = 9922;

/// Default diagnostics port.
pub const DEFAULT_DEBUG_PORT: u16 = 9933;

/// Default grace period for in-flight requests when a listener drains.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;

/// Default hard deadline after which remaining tasks are aborted.
pub const DEFAULT_HARD_DEADLINE_SECS: u64 = 30;

/// Default initial delay before a failed listener is restarted.
pub const DEFAULT_RESTART_INITIAL_DELAY_MS: u64 = 100;

/// Default maximum delay between listener restarts.
pub const DEFAULT_RESTART_MAX_DELAY_MS: u64 = 10_000;

/// Default cap on one decoded RPC message. A full agent batch runs to several MiB.
pub const DEFAULT_MAX_RECV_MSG_BYTES: usize = 20 * 1024 * 1024;

/// Default flush window length in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 10;

/// Default cap on distinct buckets held by the open window.
pub const DEFAULT_MAX_OPEN_BUCKETS: usize = 100_000;

/// Default cap on closed windows being written at once.
pub const DEFAULT_MAX_DRAINING_WINDOWS: usize = 4;

/// Default maximum flush retry attempts.
pub const DEFAULT_FLUSH_MAX_RETRIES: u32 = 3;

/// Default initial retry delay in milliseconds.
pub const DEFAULT_FLUSH_INITIAL_DELAY_MS: u64 = 100;

/// Default maximum retry delay in milliseconds.
pub const DEFAULT_FLUSH_MAX_DELAY_MS: u64 = 10_000;

/// Default retention horizon in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Default interval between retention sweeps (one day).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Default maximum concurrent storage requests.
pub const DEFAULT_MAX_OPEN_CONNS: usize = 10;

/// Default maximum idle pooled storage connections.
pub const DEFAULT_MAX_IDLE_CONNS: usize = 5;

/// Default maximum rows per Parquet row group.
pub const DEFAULT_ROW_GROUP_SIZE: usize = 1_000_000;

/// Default analytics query timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Default local storage path.
pub const DEFAULT_STORAGE_PATH: &str = "./qan-data";

/// Default configuration file, read from the working directory if present.
pub const DEFAULT_CONFIG_FILE: &str = "qan.toml";

/// QAN API service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QanConfig {
    pub server: ServerConfig,
    pub buffer: BufferConfig,
    pub retention: RetentionConfig,
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub parquet: ParquetConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
}

impl QanConfig {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in order (later sources override earlier):
    /// 1. Default values
    /// 2. `qan.toml` in the current directory (if present)
    /// 3. The file at `path` (if provided)
    /// 4. Environment variables prefixed with `QAN_`, `__` separating sections
    pub fn load(path: Option<&Path>) -> Result<Self, QanError> {
        let mut figment = Figment::new().merge(Toml::file(DEFAULT_CONFIG_FILE));

        if let Some(p) = path {
            figment = figment.merge(Toml::file(p));
        }

        let config: Self = figment
            .merge(Env::prefixed("QAN_").split("__"))
            .extract()
            .map_err(|e| QanError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), QanError> {
        if self.retention.days == 0 {
            return Err(QanError::Config(
                "retention.days must be at least 1".to_owned(),
            ));
        }
        if self.buffer.window_secs == 0 {
            return Err(QanError::Config(
                "buffer.window_secs must be greater than 0".to_owned(),
            ));
        }
        if self.buffer.max_open_buckets == 0 {
            return Err(QanError::Config(
                "buffer.max_open_buckets must be greater than 0".to_owned(),
            ));
        }
        if self.buffer.max_draining_windows == 0 {
            return Err(QanError::Config(
                "buffer.max_draining_windows must be greater than 0".to_owned(),
            ));
        }
        if self.server.max_recv_msg_bytes == 0 {
            return Err(QanError::Config(
                "server.max_recv_msg_bytes must be greater than 0".to_owned(),
            ));
        }
        if self.pool.max_open_conns == 0 {
            return Err(QanError::Config(
                "pool.max_open_conns must be greater than 0".to_owned(),
            ));
        }
        if self.retention.sweep_interval_secs == 0 {
            return Err(QanError::Config(
                "retention.sweep_interval_secs must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Listener addresses and shutdown timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Native RPC address (default: 127.0.0.1:9911).
    pub grpc_addr: SocketAddr,
    /// HTTP/JSON gateway address (default: 127.0.0.1:9922).
    pub json_addr: SocketAddr,
    /// Diagnostics address (default: 127.0.0.1:9933).
    pub debug_addr: SocketAddr,
    /// How long a draining listener waits for in-flight requests.
    pub shutdown_grace_ms: u64,
    /// Tasks still running this long after shutdown began are aborted.
    pub hard_deadline_secs: u64,
    /// Initial delay before restarting a listener whose accept loop failed.
    ///
    /// The delay doubles after each consecutive failure.
    pub restart_initial_delay_ms: u64,
    /// Cap on the restart delay.
    pub restart_max_delay_ms: u64,
    /// Largest RPC message accepted or sent, in bytes.
    pub max_recv_msg_bytes: usize,
}

impl ServerConfig {
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub const fn hard_deadline(&self) -> Duration {
        Duration::from_secs(self.hard_deadline_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_GRPC_PORT)),
            json_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_JSON_PORT)),
            debug_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_DEBUG_PORT)),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            hard_deadline_secs: DEFAULT_HARD_DEADLINE_SECS,
            restart_initial_delay_ms: DEFAULT_RESTART_INITIAL_DELAY_MS,
            restart_max_delay_ms: DEFAULT_RESTART_MAX_DELAY_MS,
            max_recv_msg_bytes: DEFAULT_MAX_RECV_MSG_BYTES,
        }
    }
}

/// Ingestion buffer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Length of one flush window in seconds.
    pub window_secs: u64,
    /// Maximum distinct buckets in the open window before new buckets are refused.
    pub max_open_buckets: usize,
    /// Closed windows allowed to be in flight to storage at once.
    ///
    /// While the cap is reached the open window stays open and keeps
    /// aggregating until a slot frees up.
    pub max_draining_windows: usize,
    /// Maximum flush retry attempts before a window is abandoned.
    ///
    /// Set to 0 to disable retries.
    pub flush_max_retries: u32,
    /// Initial retry delay in milliseconds.
    ///
    /// The delay doubles after each failed attempt, up to `flush_max_delay_ms`.
    pub flush_initial_delay_ms: u64,
    /// Maximum retry delay in milliseconds.
    pub flush_max_delay_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            max_open_buckets: DEFAULT_MAX_OPEN_BUCKETS,
            max_draining_windows: DEFAULT_MAX_DRAINING_WINDOWS,
            flush_max_retries: DEFAULT_FLUSH_MAX_RETRIES,
            flush_initial_delay_ms: DEFAULT_FLUSH_INITIAL_DELAY_MS,
            flush_max_delay_ms: DEFAULT_FLUSH_MAX_DELAY_MS,
        }
    }
}

/// Partition retention configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Partitions older than this many days are dropped. Must be at least 1.
    pub days: u32,
    /// Seconds between sweeps.
    pub sweep_interval_secs: u64,
    /// Retries per partition drop before moving on.
    pub drop_max_retries: u32,
    pub drop_initial_delay_ms: u64,
    pub drop_max_delay_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: DEFAULT_RETENTION_DAYS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            drop_max_retries: DEFAULT_FLUSH_MAX_RETRIES,
            drop_initial_delay_ms: DEFAULT_FLUSH_INITIAL_DELAY_MS,
            drop_max_delay_ms: DEFAULT_FLUSH_MAX_DELAY_MS,
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Local {
        /// Path to storage directory.
        path: PathBuf,
    },
    /// AWS S3 or S3-compatible storage (MinIO, Garage, etc.).
    S3 {
        bucket: String,
        /// Optional prefix within the bucket.
        #[serde(default)]
        prefix: String,
        region: Option<String>,
        /// Custom endpoint URL for S3-compatible services.
        endpoint: Option<String>,
        /// Access key ID (can also be set via AWS_ACCESS_KEY_ID env var).
        access_key_id: Option<String>,
        /// Secret access key (can also be set via AWS_SECRET_ACCESS_KEY env var).
        secret_access_key: Option<String>,
        #[serde(default)]
        force_path_style: bool,
        /// Allow HTTP (non-TLS) connections (for local development).
        #[serde(default)]
        allow_http: bool,
    },
    /// In-memory storage (for testing).
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from(DEFAULT_STORAGE_PATH),
        }
    }
}

/// Storage connection pool limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent requests against the store.
    pub max_open_conns: usize,
    /// Maximum idle connections kept per host (remote backends only).
    pub max_idle_conns: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
        }
    }
}

/// Parquet file configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParquetConfig {
    /// Maximum rows per row group.
    pub row_group_size: usize,
}

impl Default for ParquetConfig {
    fn default() -> Self {
        Self {
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
        }
    }
}

/// Analytics read configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Seconds before a read is abandoned. 0 disables the timeout.
    pub timeout_secs: u64,
}

impl QueryConfig {
    pub const fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = QanConfig::default();
        assert_eq!(config.server.grpc_addr.port(), DEFAULT_GRPC_PORT);
        assert_eq!(config.server.json_addr.port(), DEFAULT_JSON_PORT);
        assert_eq!(config.server.debug_addr.port(), DEFAULT_DEBUG_PORT);
        assert_eq!(config.server.shutdown_grace(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pool_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_open_conns, 10);
        assert_eq!(config.max_idle_conns, 5);
    }

    #[test]
    fn storage_defaults_to_local() {
        match StorageConfig::default() {
            StorageConfig::Local { path } => {
                assert_eq!(path, PathBuf::from(DEFAULT_STORAGE_PATH));
            }
            _ => panic!("Expected local storage as default"),
        }
    }

    #[test]
    fn zero_retention_rejected() {
        let mut config = QanConfig::default();
        config.retention.days = 0;
        assert!(matches!(config.validate(), Err(QanError::Config(_))));
    }

    #[test]
    fn zero_window_rejected() {
        let mut config = QanConfig::default();
        config.buffer.window_secs = 0;
        assert!(matches!(config.validate(), Err(QanError::Config(_))));
    }

    #[test]
    fn zero_draining_windows_rejected() {
        let mut config = QanConfig::default();
        config.buffer.max_draining_windows = 0;
        assert!(matches!(config.validate(), Err(QanError::Config(_))));
    }

    #[test]
    fn recv_limit_defaults_above_grpc_default() {
        let config = ServerConfig::default();
        assert!(config.max_recv_msg_bytes > 4 * 1024 * 1024);
    }

    #[test]
    fn zero_query_timeout_disables_it() {
        let config = QueryConfig { timeout_secs: 0 };
        assert_eq!(config.timeout(), None);
        assert_eq!(
            QueryConfig::default().timeout(),
            Some(Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS))
        );
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config: QanConfig = Figment::new()
            .merge(Toml::string(
                r#"
                [retention]
                days = 7

                [storage]
                type = "memory"

                [query]
                timeout_secs = 5

                [server]
                max_recv_msg_bytes = 1048576

                [logging]
                format = "json"
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.retention.days, 7);
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.query.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.server.max_recv_msg_bytes, 1_048_576);
        assert_eq!(config.buffer.window_secs, DEFAULT_WINDOW_SECS);
    }

    #[test]
    fn env_overrides_nested_values() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("QAN_POOL__MAX_OPEN_CONNS", "3");
            jail.set_env("QAN_SERVER__GRPC_ADDR", "0.0.0.0:7000");

            let config = QanConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.pool.max_open_conns, 3);
            assert_eq!(config.server.grpc_addr.port(), 7000);
            Ok(())
        });
    }
}
