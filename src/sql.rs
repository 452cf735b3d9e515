use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
///
/// Insert values are positional; column lists are accepted but not
/// reordered. Trailing optional columns may be omitted.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        resource: ResourceInfo,
    },
    UpdateResource {
        resource: ResourceInfo,
    },
    InsertService {
        service: Service,
    },
    UpdateService {
        service: Service,
    },
    InsertSchedule {
        schedule: Schedule,
    },
    /// Rows may target several schedules; order is kept.
    InsertScheduleEntries {
        entries: Vec<(Ulid, ScheduleEntry)>,
    },
    DeleteSchedule {
        id: Ulid,
    },
    InsertOverride {
        resource_id: Ulid,
        schedule_override: ScheduleOverride,
    },
    DeleteOverride {
        resource_id: Ulid,
        date: NaiveDate,
    },
    InsertAppointment {
        id: Ulid,
        resource_id: Ulid,
        service_id: Ulid,
        start: Ms,
        client_id: Ulid,
        subject_id: Option<Ulid>,
        notes: Option<String>,
    },
    Reschedule {
        appointment_id: Ulid,
        resource_id: Option<Ulid>,
        start: Ms,
    },
    CancelAppointment {
        id: Ulid,
        reason: Option<String>,
    },
    SetStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    InsertWaitlist {
        id: Ulid,
        client_id: Ulid,
        service_id: Ulid,
        preferred_date: NaiveDate,
        preferred_resource_id: Option<Ulid>,
        subject_id: Option<Ulid>,
    },
    DeleteWaitlist {
        id: Ulid,
    },
    OfferResponse {
        entry_id: Ulid,
        accept: bool,
    },
    SelectSlots {
        resource_id: Ulid,
        date: NaiveDate,
        service_id: Ulid,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    SelectWaitlist {
        filter: WaitlistFilter,
    },
    SelectResources,
    SelectServices,
    SelectSchedules {
        resource_id: Ulid,
    },
    /// Subscribe to one client's notifications on channel `client_{id}`.
    Listen {
        client_id: Ulid,
    },
    /// `None` drops every subscription of the connection.
    Unlisten {
        client_id: Option<Ulid>,
    },
}

#[derive(Debug, PartialEq)]
pub enum AppointmentFilter {
    Id(Ulid),
    Resource { resource_id: Ulid, date: Option<NaiveDate> },
}

#[derive(Debug, PartialEq)]
pub enum WaitlistFilter {
    Id(Ulid),
    Queue { service_id: Ulid, date: NaiveDate },
}

/// Channel name carrying one client's notifications.
pub fn client_channel(client_id: Ulid) -> String {
    format!("client_{client_id}")
}

fn parse_channel(raw: &str) -> Result<Ulid, SqlError> {
    let channel = raw.trim().trim_end_matches(';').trim().trim_matches('"');
    let id = channel
        .strip_prefix("client_")
        .ok_or_else(|| SqlError::Parse(format!("invalid channel: {channel} (expected client_{{id}})")))?;
    Ulid::from_string(id).map_err(|e| SqlError::Parse(format!("bad ULID in channel: {e}")))
}

/// The remainder of `sql` after a case-insensitive `keyword`.
fn after_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword).then(|| &sql[keyword.len()..])
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(channel) = after_keyword(trimmed, "LISTEN ") {
        return Ok(Command::Listen {
            client_id: parse_channel(channel)?,
        });
    }
    if let Some(rest) = after_keyword(trimmed, "UNLISTEN ") {
        let rest = rest.trim().trim_end_matches(';').trim();
        let client_id = if rest == "*" { None } else { Some(parse_channel(rest)?) };
        return Ok(Command::Unlisten { client_id });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without binding any parameters. Used to
/// describe result columns of prepared statements.
pub fn select_target(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    if table == "schedule_entries" {
        let mut entries = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let entry = parse_entry_row(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
            entries.push(entry);
        }
        return Ok(Command::InsertScheduleEntries { entries });
    }

    if rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let values = Row(&rows[0]);

    match table.as_str() {
        "resources" | "resource_updates" => {
            values.require("resources", 1)?;
            let resource = ResourceInfo {
                id: parse_ulid(values.get(0)?)?,
                name: values.opt(1).map(parse_string_or_null).transpose()?.flatten(),
                bookable: values.opt(2).map(parse_bool).transpose()?.unwrap_or(true),
            };
            if table == "resources" {
                Ok(Command::InsertResource { resource })
            } else {
                Ok(Command::UpdateResource { resource })
            }
        }
        "services" | "service_updates" => {
            values.require("services", 3)?;
            let service = Service {
                id: parse_ulid(values.get(0)?)?,
                name: parse_string_or_null(values.get(1)?)?,
                duration_min: parse_u32(values.get(2)?)?,
                eligible_resources: values.opt(3).map(parse_ulid_list).transpose()?.unwrap_or_default(),
            };
            if table == "services" {
                Ok(Command::InsertService { service })
            } else {
                Ok(Command::UpdateService { service })
            }
        }
        "schedules" => {
            values.require("schedules", 5)?;
            Ok(Command::InsertSchedule {
                schedule: Schedule {
                    id: parse_ulid(values.get(0)?)?,
                    resource_id: parse_ulid(values.get(1)?)?,
                    effective_from: parse_date(values.get(2)?)?,
                    effective_to: parse_date_or_null(values.get(3)?)?,
                    timezone: parse_tz(values.get(4)?)?,
                    entries: Vec::new(),
                    created_at: 0,
                },
            })
        }
        "schedule_overrides" => {
            values.require("schedule_overrides", 3)?;
            let resource_id = parse_ulid(values.get(0)?)?;
            let date = parse_date(values.get(1)?)?;
            let timezone = parse_tz(values.get(2)?)?;
            let start = values.opt(3).map(parse_time_or_null).transpose()?.flatten();
            let end = values.opt(4).map(parse_time_or_null).transpose()?.flatten();
            let break_window = parse_break(values.opt(5), values.opt(6))?;
            let hours = match (start, end) {
                (Some(start), Some(end)) => Some(DayHours { start, end, break_window }),
                (None, None) if break_window.is_none() => None,
                _ => return Err(SqlError::Parse("override needs both start_time and end_time, or neither".into())),
            };
            Ok(Command::InsertOverride {
                resource_id,
                schedule_override: ScheduleOverride { date, timezone, hours },
            })
        }
        "appointments" => {
            values.require("appointments", 5)?;
            Ok(Command::InsertAppointment {
                id: parse_ulid(values.get(0)?)?,
                resource_id: parse_ulid(values.get(1)?)?,
                service_id: parse_ulid(values.get(2)?)?,
                start: parse_i64(values.get(3)?)?,
                client_id: parse_ulid(values.get(4)?)?,
                subject_id: values.opt(5).map(parse_ulid_or_null).transpose()?.flatten(),
                notes: values.opt(6).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "reschedules" => {
            values.require("reschedules", 3)?;
            Ok(Command::Reschedule {
                appointment_id: parse_ulid(values.get(0)?)?,
                resource_id: parse_ulid_or_null(values.get(1)?)?,
                start: parse_i64(values.get(2)?)?,
            })
        }
        "cancellations" => {
            values.require("cancellations", 1)?;
            Ok(Command::CancelAppointment {
                id: parse_ulid(values.get(0)?)?,
                reason: values.opt(1).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "appointment_status" => {
            values.require("appointment_status", 2)?;
            let raw = parse_string(values.get(1)?)?;
            let status = AppointmentStatus::parse(&raw.to_lowercase())
                .ok_or_else(|| SqlError::Parse(format!("unknown status: {raw}")))?;
            Ok(Command::SetStatus {
                id: parse_ulid(values.get(0)?)?,
                status,
            })
        }
        "waitlist" => {
            values.require("waitlist", 4)?;
            Ok(Command::InsertWaitlist {
                id: parse_ulid(values.get(0)?)?,
                client_id: parse_ulid(values.get(1)?)?,
                service_id: parse_ulid(values.get(2)?)?,
                preferred_date: parse_date(values.get(3)?)?,
                preferred_resource_id: values.opt(4).map(parse_ulid_or_null).transpose()?.flatten(),
                subject_id: values.opt(5).map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "offer_responses" => {
            values.require("offer_responses", 2)?;
            Ok(Command::OfferResponse {
                entry_id: parse_ulid(values.get(0)?)?,
                accept: parse_bool(values.get(1)?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_entry_row(row: &[Expr]) -> Result<(Ulid, ScheduleEntry), SqlError> {
    let values = Row(row);
    values.require("schedule_entries", 4)?;
    let day = parse_i64(values.get(1)?)?;
    let day_of_week = u8::try_from(day).map_err(|_| SqlError::Parse(format!("{day} out of day_of_week range")))?;
    let entry = ScheduleEntry {
        day_of_week,
        hours: DayHours {
            start: parse_time(values.get(2)?)?,
            end: parse_time(values.get(3)?)?,
            break_window: parse_break(values.opt(4), values.opt(5))?,
        },
    };
    Ok((parse_ulid(values.get(0)?)?, entry))
}

fn parse_break(start: Option<&Expr>, end: Option<&Expr>) -> Result<Option<(NaiveTime, NaiveTime)>, SqlError> {
    let start = start.map(parse_time_or_null).transpose()?.flatten();
    let end = end.map(parse_time_or_null).transpose()?.flatten();
    match (start, end) {
        (Some(s), Some(e)) => Ok(Some((s, e))),
        (None, None) => Ok(None),
        _ => Err(SqlError::Parse("break needs both break_start and break_end, or neither".into())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection)?;

    match table.as_str() {
        "schedules" => Ok(Command::DeleteSchedule {
            id: filters.ulid("id")?,
        }),
        "schedule_overrides" => Ok(Command::DeleteOverride {
            resource_id: filters.ulid("resource_id")?,
            date: filters.date("date")?,
        }),
        "appointments" => Ok(Command::CancelAppointment {
            id: filters.ulid("id")?,
            reason: None,
        }),
        "waitlist" => Ok(Command::DeleteWaitlist {
            id: filters.ulid("id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = where_filters(&select.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            resource_id: filters.ulid("resource_id")?,
            date: filters.date("date")?,
            service_id: filters.ulid("service_id")?,
        }),
        "appointments" => {
            let filter = if filters.has("id") {
                AppointmentFilter::Id(filters.ulid("id")?)
            } else {
                AppointmentFilter::Resource {
                    resource_id: filters.ulid("resource_id")?,
                    date: filters.has("date").then(|| filters.date("date")).transpose()?,
                }
            };
            Ok(Command::SelectAppointments { filter })
        }
        "waitlist" => {
            let filter = if filters.has("id") {
                WaitlistFilter::Id(filters.ulid("id")?)
            } else {
                WaitlistFilter::Queue {
                    service_id: filters.ulid("service_id")?,
                    date: filters.date("date")?,
                }
            };
            Ok(Command::SelectWaitlist { filter })
        }
        "resources" => Ok(Command::SelectResources),
        "services" => Ok(Command::SelectServices),
        "schedules" => Ok(Command::SelectSchedules {
            resource_id: filters.ulid("resource_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// One VALUES row with arity checks.
struct Row<'a>(&'a [Expr]);

impl<'a> Row<'a> {
    fn require(&self, table: &'static str, n: usize) -> Result<(), SqlError> {
        if self.0.len() < n {
            return Err(SqlError::WrongArity(table, n, self.0.len()));
        }
        Ok(())
    }

    fn get(&self, i: usize) -> Result<&'a Expr, SqlError> {
        self.0
            .get(i)
            .ok_or_else(|| SqlError::Parse(format!("missing value {}", i + 1)))
    }

    fn opt(&self, i: usize) -> Option<&'a Expr> {
        self.0.get(i)
    }
}

/// `col = value` pairs from an AND-chain.
struct Filters(Vec<(String, Expr)>);

impl Filters {
    fn find(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.0
            .iter()
            .find(|(c, _)| c == col)
            .map(|(_, e)| e)
            .ok_or(SqlError::MissingFilter(col))
    }

    fn has(&self, col: &str) -> bool {
        self.0.iter().any(|(c, _)| c == col)
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.find(col)?)
    }

    fn date(&self, col: &'static str) -> Result<NaiveDate, SqlError> {
        parse_date(self.find(col)?)
    }
}

fn where_filters(selection: &Option<Expr>) -> Result<Filters, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn collect_eq(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq(left, out)?;
                collect_eq(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => collect_eq(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

/// Comma-separated ULIDs; NULL or '' is the empty list.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    let Some(raw) = parse_string_or_null(expr)? else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}"))))
        .collect()
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_date(expr).map(Some)
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<NaiveTime>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_time(expr).map(Some)
}

fn parse_tz(expr: &Expr) -> Result<Tz, SqlError> {
    let s = parse_string(expr)?;
    s.parse::<Tz>()
        .map_err(|_| SqlError::Parse(format!("unknown timezone: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
