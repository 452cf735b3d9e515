use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "agenda_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "agenda_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "agenda_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "agenda_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "agenda_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "agenda_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "agenda_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "agenda_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking attempts. Labels: operation (book, reschedule),
/// outcome (committed, slot_taken, rejected, error).
pub const BOOKINGS_TOTAL: &str = "agenda_bookings_total";

/// Counter: waitlist offer transitions. Labels: outcome
/// (offered, accepted, declined, withdrawn).
pub const WAITLIST_OFFERS_TOTAL: &str = "agenda_waitlist_offers_total";

/// Counter: offers that lapsed past their window.
pub const WAITLIST_EXPIRATIONS_TOTAL: &str = "agenda_waitlist_expirations_total";

/// Counter: notifications the dispatcher refused.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "agenda_notification_failures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::InsertService { .. } => "insert_service",
        Command::UpdateService { .. } => "update_service",
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::InsertScheduleEntries { .. } => "insert_schedule_entries",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::InsertOverride { .. } => "insert_override",
        Command::DeleteOverride { .. } => "delete_override",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::Reschedule { .. } => "reschedule",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::SetStatus { .. } => "set_status",
        Command::InsertWaitlist { .. } => "insert_waitlist",
        Command::DeleteWaitlist { .. } => "delete_waitlist",
        Command::OfferResponse { .. } => "offer_response",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectResources => "select_resources",
        Command::SelectServices => "select_services",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
