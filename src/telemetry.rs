use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;
use crate::observability::hub_metrics;

/// Initialize structured logging and switch the activity counters on or off.
/// `RUST_LOG` wins over the configured level when set.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    hub_metrics().set_enabled(config.metrics_enabled);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()?;
    }

    tracing::info!(json = config.json_logs, level = %config.log_level, "soda-hub telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span carrying the common coordination attributes
pub fn create_coordination_span(
    operation: &str,
    project: Option<&str>,
    item_id: Option<&str>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "agent_coordination",
        operation = operation,
        project = project,
        item.id = item_id,
        correlation.id = correlation_id,
    )
}

/// Final stats line, then stop
pub fn shutdown_telemetry() {
    let metrics = hub_metrics();
    if metrics.is_enabled() {
        metrics.log_stats();
    }
    tracing::info!("soda-hub telemetry shutdown complete");
}
