use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

pub static QUERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("medquery_queries_total", "Executed queries by shape", &["shape"])
        .unwrap()
});

pub static QUERY_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "medquery_query_failures_total",
        "Queries whose store call failed, by shape",
        &["shape"]
    )
    .unwrap()
});

pub static QUERY_DURATION_SEC: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "medquery_query_duration_seconds",
        "Compile + execute + shape latency",
        &["shape"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap()
});

pub static ORACLE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "medquery_oracle_failures_total",
        "Oracle outputs that could not be read as an intent"
    )
    .unwrap()
});
