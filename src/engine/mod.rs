mod booking;
mod catalog;
mod conflict;
mod error;
mod queries;
mod schedule;
mod slots;
mod waitlist;

pub use booking::BookingRequest;
pub use conflict::{system_clock, Clock};
pub use error::{EngineError, ErrorClass};
pub use schedule::{resolve, Resolution, WorkWindow};
pub use slots::{free_spans, merge_overlapping, slot_starts, subtract_intervals};
pub use waitlist::WaitlistRequest;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::DEFAULT_OFFER_WINDOW_MS;
use crate::model::*;
use crate::notify::{Notification, Notifier, TemplateKind};
use crate::wal::{Wal, WalHandle};

use waitlist::WaitlistBook;

pub type SharedCalendar = Arc<RwLock<Calendar>>;

/// Namespaces of client-chosen ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum IdSpace {
    Resource,
    Service,
    Schedule,
    Appointment,
}

/// Claim on an id that is being created. Released on drop, by which time the
/// record is either in its map or was never written.
pub(super) struct Reservation<'a> {
    reserved: &'a DashSet<(IdSpace, Ulid)>,
    key: (IdSpace, Ulid),
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.remove(&self.key);
    }
}

#[derive(Clone)]
pub struct EngineConfig {
    /// How long a waitlist offer stays open.
    pub offer_window_ms: Ms,
    pub clock: Clock,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            offer_window_ms: DEFAULT_OFFER_WINDOW_MS,
            clock: system_clock(),
        }
    }
}

/// One tenant's appointment book.
///
/// Lock order, outermost first: the commit gate (shared by every mutation,
/// exclusive for compaction), the waitlist, then calendars in ascending id
/// order. A calendar lock is never held while acquiring the waitlist.
pub struct Engine {
    pub(super) calendars: DashMap<Ulid, SharedCalendar>,
    pub(super) services: DashMap<Ulid, Service>,
    /// Every appointment ever booked, terminal ones included.
    pub(super) appointments: DashMap<Ulid, Appointment>,
    /// Reverse lookup: schedule id → resource id
    pub(super) schedule_index: DashMap<Ulid, Ulid>,
    pub(super) waitlist: Mutex<WaitlistBook>,
    /// Ids with a create in flight.
    reserved: DashSet<(IdSpace, Ulid)>,
    gate: RwLock<()>,
    wal: WalHandle,
    notifier: Arc<dyn Notifier>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notifier: Arc<dyn Notifier>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);

        let mut engine = Self {
            calendars: DashMap::new(),
            services: DashMap::new(),
            appointments: DashMap::new(),
            schedule_index: DashMap::new(),
            waitlist: Mutex::new(WaitlistBook::default()),
            reserved: DashSet::new(),
            gate: RwLock::new(()),
            wal,
            notifier,
            config,
        };

        for event in &events {
            match event {
                Event::WaitlistJoined { .. }
                | Event::WaitlistOffered { .. }
                | Event::WaitlistReverted { .. }
                | Event::WaitlistClosed { .. } => engine.waitlist.get_mut().apply(event),
                Event::OfferAccepted { .. } => {
                    engine.replay(event);
                    engine.waitlist.get_mut().apply(event);
                }
                other => engine.replay(other),
            }
        }
        if !events.is_empty() {
            info!(
                path = %wal_path.display(),
                events = events.len(),
                resources = engine.calendars.len(),
                appointments = engine.appointments.len(),
                "replayed WAL"
            );
        }

        Ok(engine)
    }

    // We're the sole owner of these Arcs during replay, so try_write always
    // succeeds. Never block here: replay may run inside an async context
    // (lazy tenant creation).
    fn replay(&self, event: &Event) {
        match event {
            Event::ResourceCreated { resource } => {
                self.calendars
                    .insert(resource.id, Arc::new(RwLock::new(Calendar::new(resource.clone()))));
            }
            Event::ServiceUpserted { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::AppointmentRescheduled {
                from_resource_id,
                resource_id,
                ..
            } if from_resource_id != resource_id => {
                let (Some(from), Some(to)) = (
                    self.get_calendar(from_resource_id),
                    self.get_calendar(resource_id),
                ) else {
                    warn!(?event, "replay: reschedule references unknown resource");
                    return;
                };
                let mut from = from.try_write().expect("replay: uncontended write");
                let mut to = to.try_write().expect("replay: uncontended write");
                self.apply_to_calendar(&mut from, Some(&mut to), event);
            }
            other => {
                if let Some(resource_id) = event_resource_id(other)
                    && let Some(cal) = self.get_calendar(&resource_id)
                {
                    let mut guard = cal.try_write().expect("replay: uncontended write");
                    self.apply_to_calendar(&mut guard, None, other);
                }
            }
        }
    }

    /// Apply a calendar event (no locking; caller holds the lock on `cal`,
    /// and on `to` when an appointment moves to another resource).
    pub(super) fn apply_to_calendar(&self, cal: &mut Calendar, to: Option<&mut Calendar>, event: &Event) {
        match event {
            Event::ResourceUpdated { resource } => {
                cal.resource = resource.clone();
            }
            Event::ScheduleCreated { schedule } => {
                self.schedule_index.insert(schedule.id, schedule.resource_id);
                cal.schedules.push(schedule.clone());
            }
            Event::ScheduleEntriesAdded {
                schedule_id, entries, ..
            } => {
                if let Some(s) = cal.schedules.iter_mut().find(|s| s.id == *schedule_id) {
                    s.entries.extend_from_slice(entries);
                }
            }
            Event::ScheduleRemoved { schedule_id, .. } => {
                cal.schedules.retain(|s| s.id != *schedule_id);
                self.schedule_index.remove(schedule_id);
            }
            Event::OverrideSet {
                schedule_override, ..
            } => {
                cal.overrides.insert(schedule_override.date, *schedule_override);
            }
            Event::OverrideCleared { date, .. } => {
                cal.overrides.remove(date);
            }
            Event::AppointmentBooked { appointment } | Event::OfferAccepted { appointment, .. } => {
                if appointment.status.is_active() {
                    cal.claim(Busy {
                        appointment_id: appointment.id,
                        span: appointment.span,
                    });
                }
                self.appointments.insert(appointment.id, appointment.clone());
            }
            Event::AppointmentRescheduled { id, date, span, .. } => {
                cal.release(*id);
                // A move always lands back in requested.
                let target = match to {
                    Some(to) => to,
                    None => cal,
                };
                target.claim(Busy {
                    appointment_id: *id,
                    span: *span,
                });
                if let Some(mut appt) = self.appointments.get_mut(id) {
                    appt.resource_id = target.resource.id;
                    appt.date = *date;
                    appt.span = *span;
                    appt.status = AppointmentStatus::Requested;
                }
            }
            Event::AppointmentStatusChanged { id, status, notes, .. } => {
                if !status.is_active() {
                    cal.release(*id);
                }
                if let Some(mut appt) = self.appointments.get_mut(id) {
                    appt.status = *status;
                    appt.notes = notes.clone();
                }
            }
            // Handled at the DashMap / waitlist level, not here.
            Event::ResourceCreated { .. }
            | Event::ServiceUpserted { .. }
            | Event::WaitlistJoined { .. }
            | Event::WaitlistOffered { .. }
            | Event::WaitlistReverted { .. }
            | Event::WaitlistClosed { .. } => {}
        }
    }

    /// Shared commit gate. Every public mutation holds it for its whole
    /// duration; nested helpers must not take it again.
    pub(super) async fn begin(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Claim `id` for a create. A second create of the same id fails here
    /// until the first one has committed or given up, so the existence check
    /// that follows cannot race.
    pub(super) fn reserve(&self, space: IdSpace, id: Ulid) -> Result<Reservation<'_>, EngineError> {
        let key = (space, id);
        if !self.reserved.insert(key) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(Reservation {
            reserved: &self.reserved,
            key,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    /// WAL-append then apply, under the caller's calendar lock.
    pub(super) async fn persist_and_apply(&self, cal: &mut Calendar, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_calendar(cal, None, event);
        Ok(())
    }

    pub fn get_calendar(&self, id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(id).map(|e| e.value().clone())
    }

    pub(super) fn calendar(&self, id: &Ulid) -> Result<SharedCalendar, EngineError> {
        self.get_calendar(id).ok_or(EngineError::NotFound(*id))
    }

    pub(super) fn service(&self, id: &Ulid) -> Result<Service, EngineError> {
        self.services
            .get(id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    pub fn now(&self) -> Ms {
        (self.config.clock)()
    }

    /// Hand a notification to the dispatcher. Failures are logged and
    /// counted; the committed change stands.
    pub(super) fn notify(&self, recipient_id: Ulid, kind: TemplateKind, payload: serde_json::Value) {
        let notification = Notification {
            recipient_id,
            kind,
            payload,
        };
        if let Err(e) = self.notifier.dispatch(notification) {
            metrics::counter!(crate::observability::NOTIFICATION_FAILURES_TOTAL).increment(1);
            warn!(%recipient_id, ?kind, "{e}");
        }
    }

    /// Rewrite the WAL as a snapshot of current state. Mutations are held off
    /// while the snapshot is taken and written.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.gate.write().await;
        let snapshot = self.snapshot().await;
        let len = snapshot.len();
        self.wal
            .compact(snapshot)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        info!(events = len, "compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}

/// Extract the resource_id from a calendar event.
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ResourceUpdated { resource } => Some(resource.id),
        Event::ScheduleCreated { schedule } => Some(schedule.resource_id),
        Event::AppointmentBooked { appointment } | Event::OfferAccepted { appointment, .. } => {
            Some(appointment.resource_id)
        }
        Event::AppointmentRescheduled {
            from_resource_id, ..
        } => Some(*from_resource_id),
        Event::ScheduleEntriesAdded { resource_id, .. }
        | Event::ScheduleRemoved { resource_id, .. }
        | Event::OverrideSet { resource_id, .. }
        | Event::OverrideCleared { resource_id, .. }
        | Event::AppointmentStatusChanged { resource_id, .. } => Some(*resource_id),
        Event::ResourceCreated { .. }
        | Event::ServiceUpserted { .. }
        | Event::WaitlistJoined { .. }
        | Event::WaitlistOffered { .. }
        | Event::WaitlistReverted { .. }
        | Event::WaitlistClosed { .. } => None,
    }
}
