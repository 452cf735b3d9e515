use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::TemplateKind;
use crate::observability::BOOKINGS_TOTAL;

use super::conflict::{check_no_conflict, check_placement, validate_instant};
use super::{Engine, EngineError, ErrorClass, IdSpace};

/// A concurrent move can change an appointment's resource between lookup and
/// lock; re-lock this many times before giving up.
const MAX_LOCK_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub client_id: Ulid,
    pub subject_id: Option<Ulid>,
    pub notes: Option<String>,
}

/// Where a booking comes from.
#[derive(Debug, Clone, Copy)]
pub(super) enum Origin {
    Direct,
    /// Acceptance of a waitlist offer: books exactly the offered interval and
    /// closes the entry in the same record.
    Offer { entry_id: Ulid, span: Span },
}

type CalendarGuard = OwnedRwLockWriteGuard<Calendar>;

impl Engine {
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Appointment, EngineError> {
        let _tx = self.begin().await;
        let result = self.book_locked(request, Origin::Direct).await;
        record_outcome("book", &result);
        if let Ok(appt) = &result {
            self.notify(appt.client_id, TemplateKind::BookingConfirmed, appointment_payload(appt));
        }
        result
    }

    /// Validate and commit one booking under the resource's write lock.
    /// Caller holds the commit gate.
    pub(super) async fn book_locked(&self, request: BookingRequest, origin: Origin) -> Result<Appointment, EngineError> {
        if request.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        validate_instant(request.start)?;
        let _claim = self.reserve(IdSpace::Appointment, request.id)?;
        let service = self.service(&request.service_id)?;
        let cal = self.calendar(&request.resource_id)?;
        let mut guard = cal.write().await;

        if self.appointments.contains_key(&request.id) {
            return Err(EngineError::AlreadyExists(request.id));
        }
        let span = match origin {
            Origin::Direct => Span::new(request.start, request.start + service.duration_ms()),
            Origin::Offer { span, .. } => span,
        };
        validate_instant(span.end)?;
        let window = check_placement(&guard, &service, &span, self.now())?;
        check_no_conflict(&guard, &span, None)?;
        if guard.busy.len() >= MAX_APPOINTMENTS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many appointments on resource"));
        }

        let appointment = Appointment {
            id: request.id,
            client_id: request.client_id,
            subject_id: request.subject_id,
            resource_id: request.resource_id,
            service_id: service.id,
            date: window.date,
            span,
            status: AppointmentStatus::Requested,
            notes: request.notes,
        };
        let event = match origin {
            Origin::Direct => Event::AppointmentBooked {
                appointment: appointment.clone(),
            },
            Origin::Offer { entry_id, .. } => Event::OfferAccepted {
                entry_id,
                appointment: appointment.clone(),
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            appointment_id = %appointment.id,
            resource_id = %appointment.resource_id,
            start = span.start,
            "booked"
        );
        Ok(appointment)
    }

    /// Move an appointment to a new start, optionally on another resource.
    /// The duration booked originally is kept; the status returns to requested.
    pub async fn reschedule(
        &self,
        appointment_id: Ulid,
        resource_id: Option<Ulid>,
        start: Ms,
    ) -> Result<Appointment, EngineError> {
        let _tx = self.begin().await;
        let result = self.reschedule_locked(appointment_id, resource_id, start).await;
        record_outcome("reschedule", &result);
        let (moved, freed) = result?;
        self.notify(moved.client_id, TemplateKind::BookingRescheduled, appointment_payload(&moved));
        self.offer_freed_slot(freed).await;
        Ok(moved)
    }

    async fn reschedule_locked(
        &self,
        id: Ulid,
        resource_id: Option<Ulid>,
        start: Ms,
    ) -> Result<(Appointment, FreedSlot), EngineError> {
        validate_instant(start)?;
        if start < self.now() {
            return Err(EngineError::PastTime);
        }

        for _ in 0..MAX_LOCK_ATTEMPTS {
            let owner = self.appointment(&id)?.resource_id;
            let target_id = resource_id.unwrap_or(owner);
            let (mut from, mut to) = self.lock_pair(owner, target_id).await?;

            let current = self.appointment(&id)?;
            if current.resource_id != owner {
                debug!(appointment_id = %id, "appointment moved while locking; retrying");
                continue;
            }
            if !current.status.is_active() {
                return Err(EngineError::transition(current.status, AppointmentStatus::Requested));
            }

            let target: &Calendar = to.as_deref().unwrap_or(&*from);
            let service = self.service(&current.service_id)?;
            let span = Span::new(start, start + current.span.duration_ms());
            validate_instant(span.end)?;
            let window = check_placement(target, &service, &span, self.now())?;
            check_no_conflict(target, &span, Some(id))?;

            let event = Event::AppointmentRescheduled {
                id,
                from_resource_id: owner,
                resource_id: target_id,
                date: window.date,
                span,
            };
            self.wal_append(&event).await?;
            self.apply_to_calendar(&mut from, to.as_deref_mut(), &event);
            info!(appointment_id = %id, from = %owner, to = %target_id, start, "rescheduled");
            return Ok((self.appointment(&id)?, FreedSlot::of(&current)));
        }
        Err(EngineError::Store("appointment kept moving; lock retries exhausted".into()))
    }

    /// Cancel an appointment. Its interval is offered to the waitlist.
    pub async fn cancel_appointment(&self, id: Ulid, reason: Option<String>) -> Result<Appointment, EngineError> {
        let _tx = self.begin().await;
        let (before, after) = self
            .set_status_locked(id, AppointmentStatus::Cancelled, reason)
            .await?;
        self.notify(after.client_id, TemplateKind::BookingCancelled, appointment_payload(&after));
        self.offer_freed_slot(FreedSlot::of(&before)).await;
        Ok(after)
    }

    /// Staff transitions: confirm, complete, no-show. Cancelling goes
    /// through [`Engine::cancel_appointment`].
    pub async fn update_status(&self, id: Ulid, status: AppointmentStatus) -> Result<Appointment, EngineError> {
        if status == AppointmentStatus::Cancelled {
            return self.cancel_appointment(id, None).await;
        }
        let _tx = self.begin().await;
        let (_, after) = self.set_status_locked(id, status, None).await?;
        Ok(after)
    }

    async fn set_status_locked(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        reason: Option<String>,
    ) -> Result<(Appointment, Appointment), EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let resource_id = self.appointment(&id)?.resource_id;
            let cal = self.calendar(&resource_id)?;
            let mut guard = cal.write().await;

            let current = self.appointment(&id)?;
            if current.resource_id != resource_id {
                continue;
            }
            check_transition(current.status, status)?;
            if status == AppointmentStatus::Cancelled && current.span.start < self.now() {
                return Err(EngineError::PastTime);
            }

            let event = Event::AppointmentStatusChanged {
                id,
                resource_id,
                status,
                notes: reason.clone().or_else(|| current.notes.clone()),
            };
            self.persist_and_apply(&mut guard, &event).await?;
            info!(appointment_id = %id, from = current.status.as_str(), to = status.as_str(), "status changed");
            return Ok((current, self.appointment(&id)?));
        }
        Err(EngineError::Store("appointment kept moving; lock retries exhausted".into()))
    }

    /// Write-lock one or two calendars in ascending id order.
    async fn lock_pair(&self, from: Ulid, to: Ulid) -> Result<(CalendarGuard, Option<CalendarGuard>), EngineError> {
        let from_cal = self.calendar(&from)?;
        if from == to {
            return Ok((from_cal.write_owned().await, None));
        }
        let to_cal = self.calendar(&to)?;
        if from < to {
            let f = from_cal.write_owned().await;
            let t = to_cal.write_owned().await;
            Ok((f, Some(t)))
        } else {
            let t = to_cal.write_owned().await;
            let f = from_cal.write_owned().await;
            Ok((f, Some(t)))
        }
    }

    pub(super) fn appointment(&self, id: &Ulid) -> Result<Appointment, EngineError> {
        self.appointments
            .get(id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }
}

fn check_transition(from: AppointmentStatus, to: AppointmentStatus) -> Result<(), EngineError> {
    use AppointmentStatus::*;
    let allowed = matches!(
        (from, to),
        (Requested, Confirmed) | (Requested | Confirmed, Completed | NoShow | Cancelled)
    );
    if allowed {
        Ok(())
    } else {
        Err(EngineError::transition(from, to))
    }
}

fn record_outcome<T>(operation: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "committed",
        Err(e) => match e.class() {
            ErrorClass::Contention => "slot_taken",
            ErrorClass::Client => "rejected",
            ErrorClass::Infrastructure => "error",
        },
    };
    metrics::counter!(BOOKINGS_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
}

pub(super) fn appointment_payload(appt: &Appointment) -> serde_json::Value {
    serde_json::json!({
        "appointment_id": appt.id.to_string(),
        "resource_id": appt.resource_id.to_string(),
        "service_id": appt.service_id.to_string(),
        "date": appt.date.to_string(),
        "start": appt.span.start,
        "end": appt.span.end,
        "status": appt.status.as_str(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use AppointmentStatus::*;
        assert!(check_transition(Requested, Confirmed).is_ok());
        assert!(check_transition(Confirmed, Completed).is_ok());
        assert!(check_transition(Requested, NoShow).is_ok());
        assert!(check_transition(Confirmed, Cancelled).is_ok());
        assert!(check_transition(Confirmed, Requested).is_err());
        assert!(check_transition(Confirmed, Confirmed).is_err());
        assert!(check_transition(Cancelled, Confirmed).is_err());
        assert!(check_transition(Completed, Cancelled).is_err());
    }
}
