//! Metric names and recording helpers.
//!
//! Labels stay low-cardinality: network, tier and outcome only.

use std::time::Duration;

use crate::network::Network;

pub const RESOLUTIONS_TOTAL: &str = "evidence_resolver_resolutions_total";
pub const BACKFILL_DISPATCH_FAILURES_TOTAL: &str = "evidence_resolver_backfill_dispatch_failures_total";
pub const BACKFILL_RUNS_TOTAL: &str = "evidence_resolver_backfill_runs_total";
pub const BACKFILL_SCAN_DURATION_SECONDS: &str = "evidence_resolver_backfill_scan_duration_seconds";

/// Registers descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        RESOLUTIONS_TOTAL,
        "resolve calls grouped by the tier that answered"
    );
    metrics::describe_counter!(
        BACKFILL_DISPATCH_FAILURES_TOTAL,
        "backfill requests that could not be queued or sent"
    );
    metrics::describe_counter!(BACKFILL_RUNS_TOTAL, "backfill jobs grouped by outcome");
    metrics::describe_histogram!(
        BACKFILL_SCAN_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "time spent scanning history for one backfill"
    );
}

/// `tier` is one of `index`, `cache` or `pending`.
pub fn record_resolution(network: Network, tier: &'static str) {
    metrics::counter!(RESOLUTIONS_TOTAL, "network" => network.name(), "tier" => tier).increment(1);
}

pub fn record_dispatch_failure(network: Network) {
    metrics::counter!(BACKFILL_DISPATCH_FAILURES_TOTAL, "network" => network.name()).increment(1);
}

pub fn record_backfill(network: Network, outcome: &'static str) {
    metrics::counter!(BACKFILL_RUNS_TOTAL, "network" => network.name(), "outcome" => outcome)
        .increment(1);
}

pub fn record_scan_duration(network: Network, elapsed: Duration) {
    metrics::histogram!(BACKFILL_SCAN_DURATION_SECONDS, "network" => network.name())
        .record(elapsed.as_secs_f64());
}
