use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;
use ulid::Ulid;

use crate::engine::{BookingRequest, EngineError, ErrorClass, WaitlistRequest};
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, AppointmentFilter, Command, SqlError, WaitlistFilter};
use crate::tenant::{Tenant, TenantManager};

/// Query handler of one connection.
pub struct AgendaHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AgendaQueryParser>,
    /// Channels this connection LISTENs on, keyed by client id.
    subscriptions: Mutex<HashMap<Ulid, broadcast::Receiver<Notification>>>,
}

impl AgendaHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AgendaQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Tenant> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.open(&db).map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<Ulid, broadcast::Receiver<Notification>>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything queued on this connection's channels since the last call.
    fn drain_notifications(&self) -> Vec<Notification> {
        let mut pending = Vec::new();
        self.subscriptions().retain(|client_id, rx| loop {
            match rx.try_recv() {
                Ok(n) => pending.push(n),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(%client_id, skipped, "listener fell behind; notifications dropped");
                }
                Err(TryRecvError::Closed) => break false,
            }
        });
        pending
    }

    /// Send pending notifications as NotificationResponse messages. They go
    /// out ahead of the current command's results.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = self.drain_notifications();
        if pending.is_empty() {
            return Ok(());
        }
        let pid = client.pid_and_secret_key().0;
        for n in pending {
            let payload = serde_json::json!({ "kind": n.kind, "payload": n.payload }).to_string();
            let message = NotificationResponse::new(pid, sql::client_channel(n.recipient_id), payload);
            client
                .send(PgWireBackendMessage::NotificationResponse(message))
                .await?;
        }
        Ok(())
    }

    /// Parse, execute and record one statement.
    async fn run(&self, tenant: &Tenant, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(tenant, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, tenant: &Tenant, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &tenant.engine;
        match cmd {
            Command::InsertResource { resource } => {
                engine.create_resource(resource).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateResource { resource } => {
                engine.update_resource(resource).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertService { service } => {
                engine.create_service(service).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateService { service } => {
                engine.update_service(service).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertSchedule { schedule } => {
                engine.create_schedule(schedule).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertScheduleEntries { entries } => {
                let count = entries.len();
                // Consecutive rows for one schedule are validated together.
                let mut groups: Vec<(Ulid, Vec<ScheduleEntry>)> = Vec::new();
                for (schedule_id, entry) in entries {
                    match groups.last_mut() {
                        Some((id, batch)) if *id == schedule_id => batch.push(entry),
                        _ => groups.push((schedule_id, vec![entry])),
                    }
                }
                for (schedule_id, batch) in groups {
                    engine
                        .add_schedule_entries(schedule_id, batch)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(inserted(count))
            }
            Command::DeleteSchedule { id } => {
                engine.remove_schedule(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::InsertOverride {
                resource_id,
                schedule_override,
            } => {
                engine
                    .set_override(resource_id, schedule_override)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteOverride { resource_id, date } => {
                let cleared = engine.clear_override(resource_id, date).await.map_err(engine_err)?;
                Ok(deleted(usize::from(cleared)))
            }
            Command::InsertAppointment {
                id,
                resource_id,
                service_id,
                start,
                client_id,
                subject_id,
                notes,
            } => {
                engine
                    .create_booking(BookingRequest {
                        id,
                        resource_id,
                        service_id,
                        start,
                        client_id,
                        subject_id,
                        notes,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::Reschedule {
                appointment_id,
                resource_id,
                start,
            } => {
                engine
                    .reschedule(appointment_id, resource_id, start)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::CancelAppointment { id, reason } => {
                engine.cancel_appointment(id, reason).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::SetStatus { id, status } => {
                engine.update_status(id, status).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertWaitlist {
                id,
                client_id,
                service_id,
                preferred_date,
                preferred_resource_id,
                subject_id,
            } => {
                engine
                    .join_waitlist(WaitlistRequest {
                        id,
                        client_id,
                        subject_id,
                        service_id,
                        preferred_date,
                        preferred_resource_id,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteWaitlist { id } => {
                engine.cancel_waitlist_entry(id).await.map_err(engine_err)?;
                Ok(deleted(1))
            }
            Command::OfferResponse { entry_id, accept } => {
                if accept {
                    engine.accept_offer(entry_id).await.map_err(engine_err)?;
                } else {
                    engine.decline_offer(entry_id).await.map_err(engine_err)?;
                }
                Ok(inserted(1))
            }
            Command::SelectSlots {
                resource_id,
                date,
                service_id,
            } => {
                let slots = engine
                    .available_slots(resource_id, date, service_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let (rid, sid, day) = (resource_id.to_string(), service_id.to_string(), date.to_string());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid)?;
                        encoder.encode_field(&sid)?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAppointments { filter } => {
                let appointments = match filter {
                    AppointmentFilter::Id(id) => vec![engine.get_appointment(&id).map_err(engine_err)?],
                    AppointmentFilter::Resource { resource_id, date } => {
                        engine.list_appointments(resource_id, date)
                    }
                };
                let schema = Arc::new(appointments_schema());
                let rows: Vec<PgWireResult<_>> = appointments
                    .iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.client_id.to_string())?;
                        encoder.encode_field(&a.subject_id.map(|s| s.to_string()))?;
                        encoder.encode_field(&a.resource_id.to_string())?;
                        encoder.encode_field(&a.service_id.to_string())?;
                        encoder.encode_field(&a.date.to_string())?;
                        encoder.encode_field(&a.span.start)?;
                        encoder.encode_field(&a.span.end)?;
                        encoder.encode_field(&a.status.as_str().to_owned())?;
                        encoder.encode_field(&a.notes)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectWaitlist { filter } => {
                let entries = match filter {
                    WaitlistFilter::Id(id) => vec![engine.get_waitlist_entry(id).await.map_err(engine_err)?],
                    WaitlistFilter::Queue { service_id, date } => engine.list_waitlist(service_id, date).await,
                };
                let schema = Arc::new(waitlist_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.client_id.to_string())?;
                        encoder.encode_field(&e.subject_id.map(|s| s.to_string()))?;
                        encoder.encode_field(&e.service_id.to_string())?;
                        encoder.encode_field(&e.preferred_date.to_string())?;
                        encoder.encode_field(&e.preferred_resource_id.map(|r| r.to_string()))?;
                        encoder.encode_field(&(e.position as i64))?;
                        encoder.encode_field(&e.status.as_str().to_owned())?;
                        encoder.encode_field(&e.offered_appointment_id.map(|a| a.to_string()))?;
                        encoder.encode_field(&e.offered_resource_id.map(|r| r.to_string()))?;
                        encoder.encode_field(&e.offered_span.map(|s| s.start))?;
                        encoder.encode_field(&e.offered_span.map(|s| s.end))?;
                        encoder.encode_field(&e.offer_expires_at)?;
                        encoder.encode_field(&e.booked_appointment_id.map(|a| a.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.bookable)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectServices => {
                let services = engine.list_services();
                let schema = Arc::new(services_schema());
                let rows: Vec<PgWireResult<_>> = services
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        let eligible = s
                            .eligible_resources
                            .iter()
                            .map(|r| r.to_string())
                            .collect::<Vec<_>>()
                            .join(",");
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&(s.duration_min as i64))?;
                        encoder.encode_field(&eligible)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSchedules { resource_id } => {
                let schedules = engine.list_schedules(resource_id).await.map_err(engine_err)?;
                let schema = Arc::new(schedules_schema());
                let rows: Vec<PgWireResult<_>> = schedules
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        let mut days: Vec<u8> = s.entries.iter().map(|e| e.day_of_week).collect();
                        days.sort_unstable();
                        let days = days.iter().map(u8::to_string).collect::<Vec<_>>().join(",");
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.resource_id.to_string())?;
                        encoder.encode_field(&s.effective_from.to_string())?;
                        encoder.encode_field(&s.effective_to.map(|d| d.to_string()))?;
                        encoder.encode_field(&s.timezone.name().to_owned())?;
                        encoder.encode_field(&s.created_at)?;
                        encoder.encode_field(&days)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Listen { client_id } => {
                let rx = tenant.notify.subscribe(client_id);
                self.subscriptions().insert(client_id, rx);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { client_id } => {
                let dropped: Vec<Ulid> = {
                    let mut subs = self.subscriptions();
                    match client_id {
                        Some(id) => subs.remove(&id).map(|_| id).into_iter().collect(),
                        None => subs.drain().map(|(id, _)| id).collect(),
                    }
                };
                for id in &dropped {
                    tenant.notify.prune(id);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn inserted(rows: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new("INSERT").with_rows(rows))]
}

fn deleted(rows: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new("DELETE").with_rows(rows))]
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text("resource_id"), text("service_id"), text("date"), int8("start"), int8("end")]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("client_id"),
        text("subject_id"),
        text("resource_id"),
        text("service_id"),
        text("date"),
        int8("start"),
        int8("end"),
        text("status"),
        text("notes"),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("client_id"),
        text("subject_id"),
        text("service_id"),
        text("preferred_date"),
        text("preferred_resource_id"),
        int8("position"),
        text("status"),
        text("offered_appointment_id"),
        text("offered_resource_id"),
        int8("offered_start"),
        int8("offered_end"),
        int8("offer_expires_at"),
        text("booked_appointment_id"),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        FieldInfo::new("bookable".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), int8("duration_minutes"), text("resource_ids")]
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("resource_id"),
        text("effective_from"),
        text("effective_to"),
        text("timezone"),
        int8("created_at"),
        text("days"),
    ]
}

/// Result columns of a statement, by the table it selects from.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_target(sql).as_deref() {
        Some("slots") => slots_schema(),
        Some("appointments") => appointments_schema(),
        Some("waitlist") => waitlist_schema(),
        Some("resources") => resources_schema(),
        Some("services") => services_schema(),
        Some("schedules") => schedules_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for AgendaHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let tenant = self.resolve_tenant(client)?;
        let result = self.run(&tenant, query).await;
        self.deliver_notifications(client).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AgendaQueryParser;

#[async_trait]
impl QueryParser for AgendaQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AgendaHandler {
    type Statement = String;
    type QueryParser = AgendaQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let tenant = self.resolve_tenant(client)?;
        let sql = substitute_params(portal);
        let result = self.run(&tenant, &sql).await;
        self.deliver_notifications(client).await?;
        let mut responses = result?;
        responses
            .pop()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every user and tenant.
#[derive(Debug)]
pub struct SharedPassword {
    password: String,
}

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AgendaFactory {
    handler: Arc<AgendaHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPassword, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AgendaFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(AgendaHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPassword { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AgendaFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
) -> std::io::Result<()> {
    let factory = Arc::new(AgendaFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine rejection.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) | EngineError::DuplicateWaitlistEntry { .. } => "23505",
        EngineError::InvalidTransition { .. } | EngineError::InvalidWaitlistState { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        other => match other.class() {
            ErrorClass::Contention => "23P01",
            ErrorClass::Infrastructure => "58030",
            ErrorClass::Client => "22023",
        },
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_counted() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("INSERT INTO reschedules VALUES ($1, $2, $3)"), 3);
        assert_eq!(count_params("SELECT $10, $2"), 10);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn engine_errors_map_to_sqlstates() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::SlotTaken(id)), "23P01");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::Store("disk".into())), "58030");
        assert_eq!(sqlstate(&EngineError::OutsideSchedule), "22023");
        assert_eq!(sqlstate(&EngineError::PastTime), "22023");
        assert_eq!(
            sqlstate(&EngineError::InvalidTransition {
                from: "completed",
                to: "cancelled"
            }),
            "55000"
        );
    }

    #[test]
    fn schema_follows_select_target() {
        assert_eq!(result_schema("SELECT * FROM slots WHERE resource_id = $1").len(), 5);
        assert_eq!(result_schema("SELECT * FROM waitlist WHERE id = $1").len(), 14);
        assert_eq!(result_schema("SELECT * FROM schedules WHERE resource_id = $1").len(), 7);
        assert!(result_schema("INSERT INTO resources (id) VALUES ($1)").is_empty());
    }
}
