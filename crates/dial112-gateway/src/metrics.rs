//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record a call session opening.
pub fn record_call_start() {
    metrics::gauge!("calls_active").increment(1.0);
    metrics::counter!("calls_total").increment(1);
}

/// Record a call session closing.
pub fn record_call_end() {
    metrics::gauge!("calls_active").decrement(1.0);
}

/// Record how a turn ended.
pub fn record_turn(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("turns_total", &labels).increment(1);
}

/// Record one collaborator round trip.
pub fn record_collaborator(service: &str, duration_secs: f64) {
    let labels = [("service", service.to_string())];
    metrics::histogram!("collaborator_duration_seconds", &labels).record(duration_secs);
}

/// Record inbound media frames that could not be used.
pub fn record_frames_dropped(count: u64) {
    metrics::counter!("media_frames_dropped_total").increment(count);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder per process; a second install is an error.
        if let Ok(handle) = install_prometheus_recorder() {
            record_turn("replied");
            assert!(handle.render().contains("turns_total"));
        }
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_call_start();
        record_call_end();
        record_collaborator("recognition", 0.25);
        record_frames_dropped(3);
        record_error("malformed_input");
    }
}
