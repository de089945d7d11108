//! Prometheus metric registration (C7, ambient). Process-wide singletons,
//! bound once at startup via `once_cell::sync::Lazy`, exactly as this
//! corpus's own `metrics.rs` modules register their counters and histograms.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

pub static PROXY_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "wakegate_proxy_requests_total",
        "Proxied requests, labelled by workload and response status code",
        &["workload", "status"]
    )
    .expect("failed to register wakegate_proxy_requests_total")
});

pub static PROXY_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "wakegate_proxy_request_duration_seconds",
        "Proxied request latency in seconds, labelled by workload",
        &["workload"]
    )
    .expect("failed to register wakegate_proxy_request_duration_seconds")
});

pub static START_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "wakegate_start_duration_seconds",
        "Wall-clock time from first ensure_running call to a successful readiness probe"
    )
    .expect("failed to register wakegate_start_duration_seconds")
});

pub static START_ATTEMPTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "wakegate_start_attempts_total",
        "Start cycles, labelled by outcome",
        &["outcome"]
    )
    .expect("failed to register wakegate_start_attempts_total")
});

pub static IDLE_STOPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wakegate_idle_stops_total",
        "Workloads stopped by the idle sweeper"
    )
    .expect("failed to register wakegate_idle_stops_total")
});

pub fn record_proxy_request(workload: &str, status: u16, elapsed: Duration) {
    PROXY_REQUESTS_TOTAL
        .with_label_values(&[workload, &status.to_string()])
        .inc();
    PROXY_REQUEST_DURATION_SECONDS
        .with_label_values(&[workload])
        .observe(elapsed.as_secs_f64());
}

pub fn record_start_success(elapsed: Duration) {
    START_DURATION_SECONDS.observe(elapsed.as_secs_f64());
    START_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
}

pub fn record_start_failure(elapsed: Duration) {
    START_DURATION_SECONDS.observe(elapsed.as_secs_f64());
    START_ATTEMPTS_TOTAL.with_label_values(&["error"]).inc();
}

pub fn record_idle_stop() {
    IDLE_STOPS_TOTAL.inc();
}

/// Renders the current registry in the Prometheus text exposition format.
pub fn encode() -> Result<Vec<u8>, prometheus::Error> {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&metric_families, &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_nonempty_text_exposition() {
        record_idle_stop();
        let buf = encode().unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("wakegate_idle_stops_total"));
    }
}
