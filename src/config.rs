//! Client configuration and defaults.
//!
//! Configuration is layered with `figment`: built-in defaults, then `config.toml`
//! and `config.yaml`, then `GRID_`-prefixed environment variables. The core
//! components never read configuration themselves; they receive the pieces they
//! need at construction.

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{GridError, Result};
use crate::retry::RetryPolicy;

/// Serde helper for Duration serialization/deserialization as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration serialization/deserialization as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Submission buffering defaults
pub mod buffering {
    use std::time::Duration;

    /// Maximum number of tasks submitted in one remote call
    pub const MAX_TASKS_PER_BUFFER: usize = 500;

    /// Number of buffers allowed in flight at once
    pub const MAX_CONCURRENT_BUFFERS: usize = 1;

    /// Inactivity delay after which a partial buffer is flushed
    pub const TIME_TRIGGER_BUFFER: Duration = Duration::from_secs(10);

    /// Number of workers submitting chunks in parallel
    pub const MAX_PARALLEL_CHANNELS: usize = 1;

    /// Payloads above this size are uploaded through the chunked stream
    pub const LARGE_PAYLOAD_THRESHOLD: usize = 4 * 1024 * 1024;

    /// Parallel payload uploads per chunk
    pub const UPLOAD_CONCURRENCY: usize = 8;
}

/// Result polling defaults
pub mod polling {
    use std::time::Duration;

    /// Result ids per status query
    pub const RESULT_POLL_CHUNK_SIZE: usize = 200;

    /// Idle waits between correlation passes, shortest first
    pub const IDLE_BACKOFF_LADDER: [Duration; 6] = [
        Duration::from_millis(10),
        Duration::from_secs(1),
        Duration::from_secs(5),
        Duration::from_secs(10),
        Duration::from_secs(20),
        Duration::from_secs(30),
    ];

    /// Wait applied while nothing is outstanding
    pub const EMPTY_REGISTRY_WAIT: Duration = Duration::from_millis(100);
}

/// Retry and timeout defaults
pub mod timeouts {
    use std::time::Duration;

    /// Attempts per remote operation, first try included
    pub const MAX_RETRIES: u32 = 5;

    /// Upper bound accepted for `max_retries`
    pub const MAX_RETRIES_LIMIT: u32 = 100;

    /// Budget spread across the delays of one retried operation
    pub const RETRY_TOTAL_TIMEOUT: Duration = Duration::from_secs(60);

    /// Timeout for establishing a transport connection
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Timeout applied to each remote call
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
}

fn default_endpoint() -> String { "http://localhost:5001".to_string() }
fn default_max_tasks_per_buffer() -> usize { buffering::MAX_TASKS_PER_BUFFER }
fn default_max_concurrent_buffers() -> usize { buffering::MAX_CONCURRENT_BUFFERS }
fn default_time_trigger_buffer() -> Duration { buffering::TIME_TRIGGER_BUFFER }
fn default_max_parallel_channels() -> usize { buffering::MAX_PARALLEL_CHANNELS }
fn default_large_payload_threshold() -> usize { buffering::LARGE_PAYLOAD_THRESHOLD }
fn default_result_poll_chunk_size() -> usize { polling::RESULT_POLL_CHUNK_SIZE }
fn default_max_retries() -> u32 { timeouts::MAX_RETRIES }
fn default_retry_total_timeout() -> Duration { timeouts::RETRY_TOTAL_TIMEOUT }
fn default_connect_timeout() -> Duration { timeouts::CONNECT_TIMEOUT }
fn default_request_timeout() -> Duration { timeouts::REQUEST_TIMEOUT }
fn default_task_max_duration() -> Duration { Duration::from_secs(300_000) }
fn default_task_max_retries() -> u32 { 3 }
fn default_task_priority() -> u32 { 1 }

/// Options the grid applies to a task, either session-wide or per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Maximum run time of one task execution
    #[serde(with = "duration_secs", default = "default_task_max_duration")]
    pub max_duration: Duration,

    /// Number of times the grid re-runs a failing task
    #[serde(default = "default_task_max_retries")]
    pub max_retries: u32,

    /// Scheduling priority
    #[serde(default = "default_task_priority")]
    pub priority: u32,

    /// Partition the task is routed to; empty means the session default
    #[serde(default)]
    pub partition_id: String,

    /// Free-form options forwarded to workers
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_duration: default_task_max_duration(),
            max_retries: default_task_max_retries(),
            priority: default_task_priority(),
            partition_id: String::new(),
            options: BTreeMap::new(),
        }
    }
}

/// TLS material for the channel connector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle of the authority that signed the grid certificate
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// PEM client certificate for mutual TLS
    #[serde(default)]
    pub client_cert: Option<PathBuf>,

    /// PEM client key for mutual TLS
    #[serde(default)]
    pub client_key: Option<PathBuf>,

    /// Server name checked against the certificate instead of the endpoint host
    #[serde(default)]
    pub domain_override: Option<String>,
}

/// Client configuration loaded from multiple sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Address of the grid control plane
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Timeout for establishing a connection
    #[serde(with = "duration_secs", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Timeout applied to each remote call
    #[serde(with = "duration_secs", default = "default_request_timeout")]
    pub request_timeout: Duration,

    // Submission
    /// Maximum number of tasks grouped into one submission
    #[serde(default = "default_max_tasks_per_buffer")]
    pub max_tasks_per_buffer: usize,

    /// Buffers allowed in flight for throttled submissions
    #[serde(default = "default_max_concurrent_buffers")]
    pub max_concurrent_buffers: usize,

    /// Inactivity delay before a partial buffer is flushed
    #[serde(with = "duration_millis", default = "default_time_trigger_buffer")]
    pub time_trigger_buffer: Duration,

    /// Number of chunk submission workers
    #[serde(default = "default_max_parallel_channels")]
    pub max_parallel_channels: usize,

    /// Payloads larger than this are uploaded through the chunked stream
    #[serde(default = "default_large_payload_threshold")]
    pub large_payload_threshold: usize,

    /// Data frame size for chunked uploads; the grid's limit is used when unset
    #[serde(default)]
    pub upload_chunk_size: Option<usize>,

    // Retry
    /// Attempts per remote operation, first try included
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Budget spread across the delays of one retried operation
    #[serde(with = "duration_millis", default = "default_retry_total_timeout")]
    pub retry_total_timeout: Duration,

    // Results
    /// Result ids per status query
    #[serde(default = "default_result_poll_chunk_size")]
    pub result_poll_chunk_size: usize,

    // Session
    /// Partitions the session may route tasks to
    #[serde(default)]
    pub partitions: Vec<String>,

    /// Default options for tasks of the session
    #[serde(default)]
    pub task_options: TaskOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            tls: TlsConfig::default(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            max_tasks_per_buffer: default_max_tasks_per_buffer(),
            max_concurrent_buffers: default_max_concurrent_buffers(),
            time_trigger_buffer: default_time_trigger_buffer(),
            max_parallel_channels: default_max_parallel_channels(),
            large_payload_threshold: default_large_payload_threshold(),
            upload_chunk_size: None,
            max_retries: default_max_retries(),
            retry_total_timeout: default_retry_total_timeout(),
            result_poll_chunk_size: default_result_poll_chunk_size(),
            partitions: Vec::new(),
            task_options: TaskOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. config.yaml (if exists)
    /// 3. config.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        Self::extract(
            Self::default_figment()
                .merge(Toml::file("config.toml"))
                .merge(Yaml::file("config.yaml"))
                .merge(Env::prefixed("GRID_").split("__")),
        )
    }

    /// Load configuration from one TOML or YAML file on top of the defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::default_figment().merge(Yaml::file(path)),
            _ => Self::default_figment().merge(Toml::file(path)),
        };
        debug!("Loading client configuration from {:?}", path);
        Self::extract(figment)
    }

    fn default_figment() -> Figment {
        Figment::from(Serialized::defaults(ClientConfig::default()))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: ClientConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(GridError::Configuration(
                "endpoint must start with http:// or https://".to_string(),
            ));
        }

        let sizes = [
            ("max_tasks_per_buffer", self.max_tasks_per_buffer),
            ("max_concurrent_buffers", self.max_concurrent_buffers),
            ("max_parallel_channels", self.max_parallel_channels),
            ("large_payload_threshold", self.large_payload_threshold),
            ("result_poll_chunk_size", self.result_poll_chunk_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(GridError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.upload_chunk_size == Some(0) {
            return Err(GridError::Configuration(
                "upload_chunk_size must be greater than zero when set".to_string(),
            ));
        }

        if self.time_trigger_buffer.is_zero() {
            return Err(GridError::Configuration(
                "time_trigger_buffer must be greater than zero".to_string(),
            ));
        }

        // Reuses the retry layer's own argument checks.
        self.retry_policy().validate()?;
        if self.max_retries > timeouts::MAX_RETRIES_LIMIT {
            return Err(GridError::Configuration(format!(
                "max_retries must be at most {}",
                timeouts::MAX_RETRIES_LIMIT
            )));
        }

        if self.tls.client_cert.is_some() != self.tls.client_key.is_some() {
            return Err(GridError::Configuration(
                "client_cert and client_key must be set together".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policy shared by every remote call of the client.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_total_timeout)
    }

    /// Number of requests allowed between `submit_async` and chunk settlement.
    pub fn max_in_flight_requests(&self) -> usize {
        self.max_concurrent_buffers
            .saturating_mul(self.max_tasks_per_buffer)
    }

    /// Export configuration to TOML format
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GridError::Configuration(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Export configuration to YAML format
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| GridError::Configuration(format!("Failed to serialize to YAML: {}", e)))
    }
}
