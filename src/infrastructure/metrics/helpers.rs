//! Metric recording helpers

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    DESERIALIZE_FAILURES_TOTAL, JOBS_POPPED_TOTAL, JOBS_PROCESSED_TOTAL, JOBS_PUSHED_TOTAL,
    JOB_DURATION_SECONDS, JOB_RETRIES_TOTAL,
};

/// Encode all registered metrics in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_pushed(connection: &str, count: usize) {
        JOBS_PUSHED_TOTAL
            .with_label_values(&[connection])
            .inc_by(count as u64);
    }

    pub fn record_popped(connection: &str) {
        JOBS_POPPED_TOTAL.with_label_values(&[connection]).inc();
    }

    pub fn record_completed() {
        JOBS_PROCESSED_TOTAL.with_label_values(&["completed"]).inc();
    }

    pub fn record_failed() {
        JOBS_PROCESSED_TOTAL.with_label_values(&["failed"]).inc();
    }

    pub fn record_retry(job: &str) {
        JOB_RETRIES_TOTAL.with_label_values(&[job]).inc();
    }

    pub fn record_deserialize_failure(connection: &str) {
        DESERIALIZE_FAILURES_TOTAL
            .with_label_values(&[connection])
            .inc();
    }

    pub fn observe_attempt(job: &str, elapsed: Duration) {
        JOB_DURATION_SECONDS
            .with_label_values(&[job])
            .observe(elapsed.as_secs_f64());
    }
}
