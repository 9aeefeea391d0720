use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "donorslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "donorslot_query_duration_seconds";

// ── Booking ─────────────────────────────────────────────────────

/// Counter: appointment requests by outcome. Labels: outcome
/// (reserved, rejected, exhausted, anomaly, invalid, beyond_horizon, timeout, error).
pub const RESERVATIONS_TOTAL: &str = "donorslot_reservations_total";

/// Counter: insert-and-recount transactions started.
pub const RESERVE_ATTEMPTS_TOTAL: &str = "donorslot_reserve_attempts_total";

/// Histogram: backoff slept between contended attempts, in seconds.
pub const RESERVE_BACKOFF_SECONDS: &str = "donorslot_reserve_backoff_seconds";

/// Histogram: wall time of a whole reservation, retries included.
pub const RESERVE_DURATION_SECONDS: &str = "donorslot_reserve_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "donorslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "donorslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "donorslot_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "donorslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "donorslot_wal_flush_batch_size";

/// Counter: WAL compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "donorslot_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertDonor { .. } => "insert_donor",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::DeleteAppointmentByStart { .. } => "delete_appointment_by_start",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectFutureAppointments => "select_future_appointments",
        Command::SelectUnavailableTimes { .. } => "select_unavailable_times",
        Command::SelectDonors { .. } => "select_donors",
    }
}
