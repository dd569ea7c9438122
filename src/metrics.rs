//! Process-wide Prometheus metrics, registered lazily and scraped by the
//! `/metrics` HTTP endpoint (§10.1).

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};

pub static SCAN_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "scan_latency_seconds",
        "Time to scan one bounded block range for one event kind.",
        &["chain", "kind"]
    )
    .unwrap()
});

pub static SCAN_LOGS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "scan_logs_processed_total",
        "Number of router event logs handled, by chain and event kind.",
        &["chain", "kind"]
    )
    .unwrap()
});

pub static PAYMENT_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "payment_attempts_total",
        "Payment attempts by chain and outcome (success, failure, timeout).",
        &["chain", "outcome"]
    )
    .unwrap()
});

pub static PAYMENT_GAS_USED: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "payment_gas_used",
        "Gas budget used by a confirmed payment transaction.",
        &["chain"]
    )
    .unwrap()
});

pub static PAYMENT_EFFECTIVE_GAS_PRICE_WEI: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "payment_effective_gas_price_wei",
        "maxFeePerGas used for a submitted payment transaction, in wei.",
        &["chain"]
    )
    .unwrap()
});

pub static CHAIN_FROZEN: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "chain_frozen",
        "1 if the payment initiator is frozen for this chain, 0 otherwise.",
        &["chain"]
    )
    .unwrap()
});
