use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "classbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "classbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "classbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "classbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "classbook_connections_rejected_total";

/// Gauge: number of loaded schools.
pub const SCHOOLS_ACTIVE: &str = "classbook_schools_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "classbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "classbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "classbook_wal_flush_batch_size";

// ── Booking domain ──────────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "classbook_bookings_created_total";

/// Counter: reservations refused because the window was taken or not offered.
pub const BOOKING_CONFLICTS_TOTAL: &str = "classbook_booking_conflicts_total";

pub const NO_CREDIT_TOTAL: &str = "classbook_no_credit_total";

/// Counter: cancellations. Labels: refunded.
pub const CANCELLATIONS_TOTAL: &str = "classbook_cancellations_total";

pub const OVERRIDES_TOTAL: &str = "classbook_status_overrides_total";

/// Counter: meeting-link provisioning attempts that failed or timed out.
pub const PROVISIONING_FAILURES_TOTAL: &str = "classbook_provisioning_failures_total";

/// Counter: mutations whose caller gave up waiting (outcome unknown to them).
pub const PERSISTENCE_TIMEOUTS_TOTAL: &str = "classbook_persistence_timeouts_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::ReplaceAvailability { .. } => "replace_availability",
        Command::ClearAvailability { .. } => "clear_availability",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlots { .. } => "select_slots",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBookingStatus { admin_override: true, .. } => "override_status",
        Command::UpdateBookingStatus { .. } => "update_status",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::InsertPackage { .. } => "insert_package",
        Command::SelectPackages { .. } => "select_packages",
        Command::SelectAttendanceLog { .. } => "select_attendance_log",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
