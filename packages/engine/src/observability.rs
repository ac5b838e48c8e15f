// packages/engine/src/observability.rs
//! Logging and metrics setup
//!
//! Logs go to stderr (stdout carries command replies), filtered by
//! `RUST_LOG` and defaulting to `info`. Metrics are recorded through the
//! `metrics` facade and exported over HTTP only when an address is
//! configured.
//!
//! | metric | type | labels |
//! |---|---|---|
//! | `botyard_operations_total` | counter | `operation`, `outcome` |
//! | `botyard_operation_duration_seconds` | histogram | `operation` |
//! | `botyard_workloads_running` | gauge | |

use crate::utils::config::LogFormat;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };
    result.map_err(|e| EngineError::Config(format!("failed to install tracing subscriber: {}", e)))
}

/// Start the Prometheus exporter when `addr` is set
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| EngineError::Config(format!("invalid metrics address '{}': {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Config(format!("failed to start metrics exporter: {}", e)))?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Count one finished lifecycle operation
pub fn record_operation(operation: &'static str, outcome: &'static str, elapsed: Duration) {
    metrics::counter!(
        "botyard_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("botyard_operation_duration_seconds", "operation" => operation)
        .record(elapsed.as_secs_f64());
}

pub fn set_running_workloads(count: usize) {
    metrics::gauge!("botyard_workloads_running").set(count as f64);
}
