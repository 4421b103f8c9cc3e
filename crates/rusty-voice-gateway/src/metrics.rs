//! Pipeline metrics, recorded through the `metrics` facade.
//!
//! Without an installed recorder every call is a no-op. The Prometheus
//! recorder is available with the `prometheus` feature.

use std::time::Duration;

#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
#[cfg(feature = "prometheus")]
pub fn install_prometheus_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    builder
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

pub fn record_session_start() {
    metrics::gauge!("voice_sessions_active").increment(1.0);
}

pub fn record_session_end() {
    metrics::gauge!("voice_sessions_active").decrement(1.0);
}

/// Time from turn start to the first generated fragment.
pub fn record_ttft(ttft: Duration) {
    metrics::histogram!("voice_ttft_seconds").record(ttft.as_secs_f64());
}

/// Results discarded because their epoch was superseded. `kind` is
/// `fragment`, `audio` or `turn`.
pub fn record_stale(kind: &'static str, count: u64) {
    if count == 0 {
        return;
    }
    metrics::counter!("voice_stale_results_total", "kind" => kind).increment(count);
}

pub fn record_frames_dropped(count: u64) {
    if count == 0 {
        return;
    }
    metrics::counter!("voice_frames_dropped_total").increment(count);
}

pub fn record_barge_in() {
    metrics::counter!("voice_barge_ins_total").increment(1);
}

/// Provider-reported tokens for one generation.
pub fn record_tokens(count: u64) {
    if count == 0 {
        return;
    }
    metrics::counter!("voice_tokens_total").increment(count);
}

/// A finished turn, labelled by outcome (`completed`, `fallback`, `halted`, ...).
pub fn record_turn(outcome: &'static str) {
    metrics::counter!("voice_turns_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder per process; this is the only test that installs it.
        let handle = install_prometheus_recorder();
        record_barge_in();
        record_turn("completed");
        let output = handle.render();
        assert!(output.contains("voice_barge_ins_total"));
        assert!(output.contains("outcome=\"completed\""));
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_session_start();
        record_ttft(Duration::from_millis(350));
        record_stale("audio", 3);
        record_stale("fragment", 0);
        record_frames_dropped(2);
        record_tokens(0);
        record_tokens(57);
        record_session_end();
    }
}
