//! Prometheus metrics for the job queue.
//!
//! - Throughput (pushed, popped, processed by outcome)
//! - Retries and deserialization failures
//! - Job execution latency

mod helpers;

pub use helpers::{encode_metrics, QueueMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "orbit_queue";

lazy_static! {
    /// Jobs handed to a driver, by connection
    pub static ref JOBS_PUSHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_pushed_total", METRIC_PREFIX),
        "Total jobs pushed to a queue",
        &["connection"]
    ).unwrap();

    /// Jobs taken from a driver, by connection
    pub static ref JOBS_POPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_popped_total", METRIC_PREFIX),
        "Total jobs popped from a queue",
        &["connection"]
    ).unwrap();

    /// Finished jobs by outcome (completed, failed)
    pub static ref JOBS_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_processed_total", METRIC_PREFIX),
        "Total jobs processed by outcome",
        &["outcome"]
    ).unwrap();

    /// Retry attempts scheduled after a failure
    pub static ref JOB_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_job_retries_total", METRIC_PREFIX),
        "Total job retries",
        &["job"]
    ).unwrap();

    /// Envelopes dropped because they could not be turned back into jobs
    pub static ref DESERIALIZE_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deserialize_failures_total", METRIC_PREFIX),
        "Total envelopes that failed to deserialize",
        &["connection"]
    ).unwrap();

    /// Time spent in a single handle() attempt
    pub static ref JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        format!("{}_job_duration_seconds", METRIC_PREFIX),
        "Job attempt duration in seconds",
        &["job"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();
}
