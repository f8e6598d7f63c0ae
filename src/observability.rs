use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking state-machine operations. Labels: op, outcome.
pub const TRANSITIONS_TOTAL: &str = "voltra_transitions_total";

/// Counter: reservation requests rejected for window overlap.
pub const CONFLICTS_TOTAL: &str = "voltra_conflicts_total";

/// Counter: slot adjustments rejected at the counter bounds.
pub const SLOT_VIOLATIONS_TOTAL: &str = "voltra_slot_violations_total";

/// Counter: payment reconciliations. Labels: result (unchanged/resolved/error).
pub const PAYMENT_SYNCS_TOTAL: &str = "voltra_payment_syncs_total";

// ── USE metrics (background work) ───────────────────────────────

/// Counter: bookings auto-cancelled by the expiry sweep.
pub const BOOKINGS_EXPIRED_TOTAL: &str = "voltra_bookings_expired_total";

/// Counter: payments expired by the sweep.
pub const PAYMENTS_EXPIRED_TOTAL: &str = "voltra_payments_expired_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "voltra_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "voltra_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Record a state-machine operation outcome.
pub(crate) fn record_transition(op: &'static str, ok: bool) {
    let outcome = if ok { "ok" } else { "rejected" };
    metrics::counter!(TRANSITIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}
