use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "presscache_gate_bypass_total",
            Unit::Count,
            "Requests the gate excluded from caching, by reason."
        );
        describe_counter!(
            "presscache_artifact_hit_total",
            Unit::Count,
            "Requests answered from a stored page artifact."
        );
        describe_counter!(
            "presscache_artifact_miss_total",
            Unit::Count,
            "Cacheable requests that had to be rendered."
        );
        describe_counter!(
            "presscache_artifact_write_total",
            Unit::Count,
            "Page artifact writes, by kind and result."
        );
        describe_counter!(
            "presscache_transform_failed_total",
            Unit::Count,
            "Transform stages that failed and passed their input through."
        );
        describe_counter!(
            "presscache_invalidate_total",
            Unit::Count,
            "Invalidations, by scope."
        );
        describe_histogram!(
            "presscache_pipeline_ms",
            Unit::Milliseconds,
            "Capture pipeline latency in milliseconds."
        );
    });
}
