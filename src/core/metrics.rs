use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);

    metrics::describe_counter!("evaluations_total", "Submissions evaluated, by final status");
    metrics::describe_counter!(
        "evaluation_failures_total",
        "Failed submissions, by the pipeline stage that failed"
    );
    metrics::describe_histogram!(
        "evaluation_duration_seconds",
        "Wall time of one submission through the pipeline"
    );
    metrics::describe_counter!(
        "scorer_coerced_responses_total",
        "Model answers replaced by the low-confidence default"
    );

    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}
