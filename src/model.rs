use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds; the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Schedules ────────────────────────────────────────────────────

/// Wall-clock working hours for one day, with an optional break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub break_window: Option<(NaiveTime, NaiveTime)>,
}

impl DayHours {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.start >= self.end {
            return Err("work start must be before work end");
        }
        if let Some((break_start, break_end)) = self.break_window {
            if break_start >= break_end {
                return Err("break start must be before break end");
            }
            if break_start < self.start || break_end > self.end {
                return Err("break must lie inside working hours");
            }
        }
        Ok(())
    }
}

/// One weekday of a weekly schedule. `day_of_week` is 0 = Sunday … 6 = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub day_of_week: u8,
    pub hours: DayHours,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub effective_from: NaiveDate,
    /// `None` = open-ended.
    pub effective_to: Option<NaiveDate>,
    pub timezone: Tz,
    pub entries: Vec<ScheduleEntry>,
    /// Engine clock at creation; the resolver's tie-breaker.
    pub created_at: Ms,
}

impl Schedule {
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.effective_from <= date && self.effective_to.is_none_or(|to| date <= to)
    }

    /// True if the two effective date ranges share at least one day.
    pub fn overlaps_range(&self, other: &Schedule) -> bool {
        let self_before_other = self.effective_to.is_some_and(|to| to < other.effective_from);
        let other_before_self = other.effective_to.is_some_and(|to| to < self.effective_from);
        !self_before_other && !other_before_self
    }

    pub fn entry_for(&self, date: NaiveDate) -> Option<&ScheduleEntry> {
        let dow = weekday_index(date);
        self.entries.iter().find(|e| e.day_of_week == dow)
    }
}

/// Date-specific replacement for the weekly schedule. `hours = None` is a day off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOverride {
    pub date: NaiveDate,
    pub timezone: Tz,
    pub hours: Option<DayHours>,
}

pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Convert a wall-clock time on `date` in `tz` to an instant.
/// Times skipped by a DST transition have no instant.
pub fn local_to_ms(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<Ms> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Calendar date of an instant as seen in `tz`.
pub fn local_date(tz: Tz, at: Ms) -> Option<NaiveDate> {
    tz.timestamp_millis_opt(at).single().map(|dt| dt.date_naive())
}

// ── Catalogue ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub bookable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: Option<String>,
    pub duration_min: u32,
    /// Resources allowed to perform this service. Empty = any resource.
    pub eligible_resources: Vec<Ulid>,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_min as Ms * MINUTE_MS
    }

    pub fn allows(&self, resource_id: &Ulid) -> bool {
        self.eligible_resources.is_empty() || self.eligible_resources.contains(resource_id)
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Requested,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    /// Requested and confirmed appointments hold their interval.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Requested | Self::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "confirmed" => Some(Self::Confirmed),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "no_show" => Some(Self::NoShow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub client_id: Ulid,
    pub subject_id: Option<Ulid>,
    pub resource_id: Ulid,
    pub service_id: Ulid,
    /// Local date of `span.start` in the resource's schedule timezone.
    pub date: NaiveDate,
    pub span: Span,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
}

// ── Waitlist ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Waiting,
    Offered,
    Accepted,
    Expired,
    Cancelled,
}

impl WaitlistStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Expired | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub client_id: Ulid,
    pub subject_id: Option<Ulid>,
    pub service_id: Ulid,
    pub preferred_date: NaiveDate,
    pub preferred_resource_id: Option<Ulid>,
    /// Queue order within (service, date); lower is earlier.
    pub position: u64,
    pub status: WaitlistStatus,
    /// The appointment whose interval was freed and is on offer, if the
    /// slot came from one rather than from newly opened hours.
    pub offered_appointment_id: Option<Ulid>,
    pub offered_resource_id: Option<Ulid>,
    pub offered_span: Option<Span>,
    pub offer_expires_at: Option<Ms>,
    pub booked_appointment_id: Option<Ulid>,
}

impl WaitlistEntry {
    pub fn offer_lapsed(&self, now: Ms) -> bool {
        self.status == WaitlistStatus::Offered && self.offer_expires_at.is_some_and(|t| t <= now)
    }

    /// The slot currently (or last) offered to this entry.
    pub fn offered_slot(&self) -> Option<FreedSlot> {
        Some(FreedSlot {
            appointment_id: self.offered_appointment_id,
            resource_id: self.offered_resource_id?,
            service_id: self.service_id,
            date: self.preferred_date,
            span: self.offered_span?,
        })
    }
}

/// An interval given up by a cancelled or rescheduled appointment, or one
/// opened by a schedule change.
///
/// The interval is captured when it is freed and travels unchanged through
/// the cascade; whether it is still free is re-checked at every offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreedSlot {
    pub appointment_id: Option<Ulid>,
    pub resource_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

impl FreedSlot {
    pub fn of(appointment: &Appointment) -> Self {
        Self {
            appointment_id: Some(appointment.id),
            resource_id: appointment.resource_id,
            service_id: appointment.service_id,
            date: appointment.date,
            span: appointment.span,
        }
    }
}

// ── Per-resource calendar ────────────────────────────────────────

/// Interval claimed by a requested or confirmed appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy {
    pub appointment_id: Ulid,
    pub span: Span,
}

/// Everything the booking path needs to decide on one resource, guarded by one lock.
#[derive(Debug, Clone)]
pub struct Calendar {
    pub resource: ResourceInfo,
    pub schedules: Vec<Schedule>,
    pub overrides: BTreeMap<NaiveDate, ScheduleOverride>,
    /// Busy intervals, sorted by `span.start`.
    pub busy: Vec<Busy>,
}

impl Calendar {
    pub fn new(resource: ResourceInfo) -> Self {
        Self {
            resource,
            schedules: Vec::new(),
            overrides: BTreeMap::new(),
            busy: Vec::new(),
        }
    }

    /// Insert a claim maintaining sort order by span.start.
    pub fn claim(&mut self, busy: Busy) {
        let pos = self
            .busy
            .binary_search_by_key(&busy.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.busy.insert(pos, busy);
    }

    pub fn release(&mut self, appointment_id: Ulid) -> Option<Busy> {
        let pos = self.busy.iter().position(|b| b.appointment_id == appointment_id)?;
        Some(self.busy.remove(pos))
    }

    /// Claims whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Busy> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.busy.partition_point(|b| b.span.start < query.end);
        self.busy[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// WAL record format. Creation events carry whole records so a compacted
/// log is just a snapshot of current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        resource: ResourceInfo,
    },
    ResourceUpdated {
        resource: ResourceInfo,
    },
    ServiceUpserted {
        service: Service,
    },
    ScheduleCreated {
        schedule: Schedule,
    },
    ScheduleEntriesAdded {
        schedule_id: Ulid,
        resource_id: Ulid,
        entries: Vec<ScheduleEntry>,
    },
    ScheduleRemoved {
        schedule_id: Ulid,
        resource_id: Ulid,
    },
    OverrideSet {
        resource_id: Ulid,
        schedule_override: ScheduleOverride,
    },
    OverrideCleared {
        resource_id: Ulid,
        date: NaiveDate,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        from_resource_id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
    },
    AppointmentStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: AppointmentStatus,
        notes: Option<String>,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistOffered {
        id: Ulid,
        slot: FreedSlot,
        expires_at: Ms,
    },
    /// Offer withdrawn; the entry keeps its position.
    WaitlistReverted {
        id: Ulid,
    },
    WaitlistClosed {
        id: Ulid,
        status: WaitlistStatus,
        booked_appointment_id: Option<Ulid>,
    },
    /// Books the offered interval and closes the entry in one record.
    OfferAccepted {
        entry_id: Ulid,
        appointment: Appointment,
    },
}
