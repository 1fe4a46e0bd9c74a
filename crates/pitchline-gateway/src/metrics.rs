//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use pitchline_media::voice_session::SessionStats;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))
}

/// Record a realtime stream starting.
pub fn record_stream_open() {
    metrics::gauge!("realtime_sessions_active").increment(1.0);
}

/// Record a realtime stream ending, with its per-session counters.
pub fn record_stream_close(stats: &SessionStats) {
    metrics::gauge!("realtime_sessions_active").decrement(1.0);
    metrics::counter!("turns_total").increment(stats.turns);
    metrics::counter!("reply_failures_total").increment(stats.reply_failures);
    metrics::counter!("synthesis_failures_total").increment(stats.synthesis_failures);
    metrics::counter!("audio_frames_total").increment(stats.frames_in);
    metrics::counter!("audio_frames_dropped_total").increment(stats.frames_dropped);
}

/// Record an HTTP endpoint call with its duration.
pub fn record_request(route: &str, duration_secs: f64) {
    let labels = [("route", route.to_string())];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_request_duration_seconds", &labels).record(duration_secs);
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
        // Can only install once per process.
        let handle = install_prometheus_recorder().unwrap();
        record_stream_open();
        record_stream_close(&SessionStats {
            turns: 2,
            ..SessionStats::default()
        });
        let output = handle.render();
        assert!(output.contains("turns_total"));
    }

    #[test]
    fn test_record_without_recorder_does_not_panic() {
        record_request("/tts", 0.05);
        record_error("synthesis");
    }
}
