//! Prometheus metrics for wallet-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, HistogramVec,
    IntCounter, TextEncoder,
};

/// HTTP request counter by method, route and status.
pub static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "wallet_http_requests_total",
        "Total number of HTTP requests",
        &["method", "route", "status"]
    )
    .expect("Failed to register http_requests_total")
});

/// HTTP request duration histogram by method and route.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "wallet_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register http_request_duration")
});

/// Ledger postings by transaction type and outcome.
pub static LEDGER_POSTINGS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "wallet_ledger_postings_total",
        "Total number of ledger postings",
        &["transaction_type", "outcome"] // ok, replayed, or an error kind
    )
    .expect("Failed to register ledger_postings_total")
});

/// Retries caused by lock contention.
pub static LEDGER_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "wallet_ledger_retries_total",
        "Total number of contended ledger attempts",
        &["operation"]
    )
    .expect("Failed to register ledger_retries_total")
});

/// Consumption requests reaching a terminal state.
pub static CONSUMPTION_OUTCOMES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "wallet_consumption_outcomes_total",
        "Consumption requests by terminal outcome",
        &["outcome"]
    )
    .expect("Failed to register consumption_outcomes_total")
});

/// Completed requests whose debit could not be committed.
pub static UNSETTLED_COMPLETIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wallet_unsettled_completions_total",
        "Completed consumption requests left without a committed debit"
    )
    .expect("Failed to register unsettled_completions_total")
});

/// Settlements committed by the reconciliation pass.
pub static SETTLEMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "wallet_settlements_total",
        "Settlement attempts for unsettled completions",
        &["outcome"]
    )
    .expect("Failed to register settlements_total")
});

/// Rejected payment signatures.
pub static SIGNATURE_FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "wallet_signature_failures_total",
        "Payment signatures that failed verification",
        &["source"] // checkout, webhook
    )
    .expect("Failed to register signature_failures_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "wallet_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS_TOTAL);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&LEDGER_POSTINGS_TOTAL);
    Lazy::force(&LEDGER_RETRIES_TOTAL);
    Lazy::force(&CONSUMPTION_OUTCOMES_TOTAL);
    Lazy::force(&UNSETTLED_COMPLETIONS_TOTAL);
    Lazy::force(&SETTLEMENTS_TOTAL);
    Lazy::force(&SIGNATURE_FAILURES_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
