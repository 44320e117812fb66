//! Logging and metrics setup.
//!
//! The library only emits `tracing` events and `metrics` measurements. Binaries
//! decide where they go: [`init_tracing`] installs a subscriber, and any
//! `metrics` recorder installed by the host application receives the series
//! described by [`describe_metrics`].

use metrics::{describe_counter, describe_gauge, Unit};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{GridError, Result};

/// Metric names recorded by the runtime.
pub mod names {
    pub const TASKS_SUBMITTED: &str = "grid_tasks_submitted_total";
    pub const CHUNKS_FAILED: &str = "grid_chunks_failed_total";
    pub const RETRY_ATTEMPTS: &str = "grid_retry_attempts_total";
    pub const RESULTS_SETTLED: &str = "grid_results_settled_total";
    pub const CONNECTIONS_CREATED: &str = "grid_pool_connections_created_total";
    pub const CONNECTIONS_DISCARDED: &str = "grid_pool_connections_discarded_total";
    pub const OUTSTANDING_TASKS: &str = "grid_outstanding_tasks";
}

/// Configuration for log output.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name attached to the startup event.
    pub service_name: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Log level filter, used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "grid-dispatch".to_string(),
            json: false,
            log_level: "info".to_string(),
        }
    }
}

/// Install a global `tracing` subscriber.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.map_err(|e| GridError::Internal(format!("Failed to install subscriber: {}", e)))?;

    info!(service = %config.service_name, "Tracing initialized");
    Ok(())
}

/// Register descriptions for every series the runtime records.
pub fn describe_metrics() {
    describe_counter!(
        names::TASKS_SUBMITTED,
        Unit::Count,
        "Tasks that obtained an identifier from the grid"
    );
    describe_counter!(
        names::CHUNKS_FAILED,
        Unit::Count,
        "Submission chunks rejected as a whole"
    );
    describe_counter!(
        names::RETRY_ATTEMPTS,
        Unit::Count,
        "Re-attempts of remote operations, by operation"
    );
    describe_counter!(
        names::RESULTS_SETTLED,
        Unit::Count,
        "Outstanding tasks settled, by outcome"
    );
    describe_counter!(
        names::CONNECTIONS_CREATED,
        Unit::Count,
        "Connections opened by the pool"
    );
    describe_counter!(
        names::CONNECTIONS_DISCARDED,
        Unit::Count,
        "Unhealthy connections dropped by the pool"
    );
    describe_gauge!(
        names::OUTSTANDING_TASKS,
        Unit::Count,
        "Tasks waiting for their result"
    );
}
