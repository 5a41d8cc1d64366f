//! Prometheus metrics for monitoring
//!
//! Collectors are registered with the default registry; embedding
//! applications decide how to expose them.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, GaugeVec,
};

lazy_static! {
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "txkeeper_transactions_submitted_total",
        "Transactions accepted by the network on first broadcast",
        &["account"]
    ).unwrap();

    pub static ref TX_SUBMIT_FAILED: CounterVec = register_counter_vec!(
        "txkeeper_transactions_submit_failed_total",
        "Submissions that failed after retries",
        &["account"]
    ).unwrap();

    pub static ref TX_BUMPED: CounterVec = register_counter_vec!(
        "txkeeper_transactions_bumped_total",
        "Fee-bump replacements broadcast",
        &["account"]
    ).unwrap();

    pub static ref TX_REBROADCAST: CounterVec = register_counter_vec!(
        "txkeeper_transactions_rebroadcast_total",
        "Unchanged variants rebroadcast against mempool loss",
        &["account"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txkeeper_transactions_confirmed_total",
        "Transactions resolved as confirmed, by resolution kind",
        &["account", "kind"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "txkeeper_transactions_failed_total",
        "Transactions resolved as reverted or rejected",
        &["account", "kind"]
    ).unwrap();

    pub static ref PENDING_RECORDS: GaugeVec = register_gauge_vec!(
        "txkeeper_pending_records",
        "Outstanding nonce records awaiting confirmation",
        &["account"]
    ).unwrap();
}

pub(crate) fn record_submitted(account: &str) {
    TX_SUBMITTED.with_label_values(&[account]).inc();
}

pub(crate) fn record_submit_failed(account: &str) {
    TX_SUBMIT_FAILED.with_label_values(&[account]).inc();
}

pub(crate) fn record_bumped(account: &str) {
    TX_BUMPED.with_label_values(&[account]).inc();
}

pub(crate) fn record_rebroadcast(account: &str) {
    TX_REBROADCAST.with_label_values(&[account]).inc();
}

pub(crate) fn record_confirmed(account: &str, kind: &str) {
    TX_CONFIRMED.with_label_values(&[account, kind]).inc();
}

pub(crate) fn record_failed(account: &str, kind: &str) {
    TX_FAILED.with_label_values(&[account, kind]).inc();
}

pub(crate) fn set_pending_records(account: &str, count: usize) {
    PENDING_RECORDS
        .with_label_values(&[account])
        .set(count as f64);
}
