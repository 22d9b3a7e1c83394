use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Raw key lookup. `Config::from_env` reads the process environment,
/// tests hand in a map.
struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn opt(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|s| !s.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.opt(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::invalid(key, &raw, e)),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.opt(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, &raw, "expected a boolean")),
            },
        }
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub postgres: PostgresConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };
        Ok(Self {
            server: ServerConfig::from_vars(&vars)?,
            broker: BrokerConfig::from_vars(&vars)?,
            worker: WorkerConfig::from_vars(&vars)?,
            storage: StorageConfig::from_vars(&vars)?,
            postgres: PostgresConfig::from_vars(&vars)?,
            metrics: MetricsConfig::from_vars(&vars)?,
        })
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  server:   {}:{}, rate_limit={}/s",
            self.server.host, self.server.port, self.server.rate_limit_per_sec);
        tracing::info!("  broker:   host={}, work={}/{}, results={}/{}",
            self.broker.host,
            self.broker.work.frontend, self.broker.work.backend,
            self.broker.results.frontend, self.broker.results.backend);
        tracing::info!("  worker:   concurrency={}, ack_mode={}, shutdown_timeout={}s",
            self.worker.concurrency, self.worker.ack_mode, self.worker.shutdown_timeout_secs);
        tracing::info!("  storage:  backend={}, endpoint={}, bucket={}",
            self.storage.backend, self.storage.endpoint, self.storage.bucket);
        tracing::info!("  postgres: host={}, db={}, max_connections={}",
            self.postgres.host, self.postgres.database, self.postgres.max_connections);
        tracing::info!("  metrics:  enabled={}, path={}", self.metrics.enabled, self.metrics.path);
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port,
                "rate_limit_per_sec": self.server.rate_limit_per_sec,
            },
            "broker": {
                "host": self.broker.host,
                "work": { "frontend": self.broker.work.frontend, "backend": self.broker.work.backend },
                "results": { "frontend": self.broker.results.frontend, "backend": self.broker.results.backend },
            },
            "worker": {
                "concurrency": self.worker.concurrency,
                "ack_mode": self.worker.ack_mode,
                "shutdown_timeout_secs": self.worker.shutdown_timeout_secs,
            },
            "storage": {
                "backend": self.storage.backend,
                "endpoint": self.storage.endpoint,
                "bucket": self.storage.bucket,
                "use_ssl": self.storage.use_ssl,
            },
            "postgres": {
                "host": self.postgres.host,
                "port": self.postgres.port,
                "database": self.postgres.database,
                "max_connections": self.postgres.max_connections,
            },
            "metrics": { "enabled": self.metrics.enabled, "path": self.metrics.path },
        })
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Requests per second allowed per client IP. 0 disables the limit.
    pub rate_limit_per_sec: u32,
}

impl ServerConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: v.or("SERVER_HOST", "0.0.0.0"),
            port: v.parse("SERVER_PORT", 8080)?,
            rate_limit_per_sec: v.parse("SERVER_RATE_LIMIT_PER_SEC", 50)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Broker ────────────────────────────────────────────────────

/// Frontend (producers push) and backend (consumers pull) ports of one queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuePorts {
    pub frontend: u16,
    pub backend: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Host services connect to.
    pub host: String,
    /// Interface the broker binds on.
    pub bind_host: String,
    pub work: QueuePorts,
    pub results: QueuePorts,
}

impl BrokerConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: v.or("BROKER_HOST", "broker"),
            bind_host: v.or("BROKER_BIND_HOST", "0.0.0.0"),
            work: QueuePorts {
                frontend: v.parse("BROKER_WORK_FRONTEND_PORT", 5560)?,
                backend: v.parse("BROKER_WORK_BACKEND_PORT", 5561)?,
            },
            results: QueuePorts {
                frontend: v.parse("BROKER_RESULT_FRONTEND_PORT", 5562)?,
                backend: v.parse("BROKER_RESULT_BACKEND_PORT", 5563)?,
            },
        })
    }
}

// ── Worker ────────────────────────────────────────────────────

/// When a consumed delivery is acknowledged to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledge as soon as the delivery is received (auto-ack).
    #[default]
    OnDelivery,
    /// Acknowledge once the job task has finished, whatever its outcome.
    AfterProcessing,
}

impl FromStr for AckMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_delivery" | "auto" => Ok(Self::OnDelivery),
            "after_processing" | "manual" => Ok(Self::AfterProcessing),
            other => Err(ConfigError::UnknownAckMode(other.to_string())),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnDelivery => f.write_str("on_delivery"),
            Self::AfterProcessing => f.write_str("after_processing"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub ack_mode: AckMode,
    pub shutdown_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl WorkerConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        let concurrency: usize = v.parse("WORKER_CONCURRENCY", 5)?;
        if concurrency == 0 {
            return Err(ConfigError::invalid("WORKER_CONCURRENCY", "0", "must be at least 1"));
        }
        let ack_mode = match v.opt("WORKER_ACK_MODE") {
            Some(raw) => raw.parse()?,
            None => AckMode::default(),
        };
        Ok(Self {
            concurrency,
            ack_mode,
            shutdown_timeout_secs: v.parse("WORKER_SHUTDOWN_TIMEOUT_SECS", 30)?,
            download_timeout_secs: v.parse("DOWNLOAD_TIMEOUT_SECS", 30)?,
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

// ── Object storage ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// S3-compatible endpoint (MinIO in the default deployment).
    S3,
    Local,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" | "minio" => Ok(Self::S3),
            "local" | "fs" => Ok(Self::Local),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::UnknownStorageBackend(other.to_string())),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3 => f.write_str("s3"),
            Self::Local => f.write_str("local"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub use_ssl: bool,
    pub bucket: String,
    pub region: String,
    pub local_dir: String,
}

impl StorageConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        let backend = match v.opt("STORAGE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StorageBackend::S3,
        };
        Ok(Self {
            backend,
            endpoint: v.or("MINIO_ENDPOINT", "minio:9000"),
            access_key: v.or("MINIO_ACCESS_KEY", "minioadmin"),
            secret_key: v.or("MINIO_SECRET_KEY", "minioadmin"),
            use_ssl: v.flag("MINIO_USE_SSL", false)?,
            bucket: v.or("MINIO_BUCKET", "images"),
            region: v.or("MINIO_REGION", "us-east-1"),
            local_dir: v.or("STORAGE_LOCAL_DIR", "data/images"),
        })
    }

    /// Endpoint with scheme, as the S3 client expects it.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            return self.endpoint.clone();
        }
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: v.or("DB_HOST", "postgres"),
            port: v.parse("DB_PORT", 5432)?,
            database: v.or("DB_NAME", "images"),
            username: v.or("DB_USER", "postgres"),
            password: v.or("DB_PASSWORD", "postgres"),
            ssl_mode: v.or("DB_SSLMODE", "disable"),
            max_connections: v.parse("DB_MAX_CONNECTIONS", 10)?,
        })
    }
}

// ── Metrics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Unset means each service falls back to its own default port.
    pub port: Option<u16>,
    pub path: String,
}

impl MetricsConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        let path = v.or("METRICS_PATH", "/metrics");
        if !path.starts_with('/') {
            return Err(ConfigError::invalid("METRICS_PATH", &path, "must start with '/'"));
        }
        Ok(Self {
            enabled: v.flag("METRICS_ENABLED", true)?,
            port: v.parse_opt("METRICS_PORT")?,
            path,
        })
    }

    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}
