use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Counter: bookings rejected by the write-time conflict check.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotd_booking_conflicts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertShop { .. } => "insert_shop",
        Command::DeleteShop { .. } => "delete_shop",
        Command::SetHours { .. } => "set_hours",
        Command::InsertClosure { .. } => "insert_closure",
        Command::DeleteClosure { .. } => "delete_closure",
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertStaff { .. } => "insert_staff",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::SetStaffHours { .. } => "set_staff_hours",
        Command::AssignService { .. } => "assign_service",
        Command::UnassignService { .. } => "unassign_service",
        Command::InsertTimeOff { .. } => "insert_time_off",
        Command::DeleteTimeOff { .. } => "delete_time_off",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::SelectShops => "select_shops",
        Command::SelectServices { .. } => "select_services",
        Command::SelectStaff { .. } => "select_staff",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectStats { .. } => "select_stats",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
