use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;

use super::schedule::{locate, WorkWindow};
use super::EngineError;

/// Source of "now" for past-time guards and offer deadlines.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(now_ms)
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// The interval must sit inside working hours and clear the break.
pub(crate) fn check_within_window(window: &WorkWindow, span: &Span) -> Result<(), EngineError> {
    if !window.span.contains_span(span) {
        return Err(EngineError::OutsideSchedule);
    }
    if window.break_span.is_some_and(|b| b.overlaps(span)) {
        return Err(EngineError::OutsideSchedule);
    }
    Ok(())
}

/// Everything a new interval on `cal` must satisfy apart from not
/// overlapping other bookings. Returns the working window it falls in.
pub(crate) fn check_placement(cal: &Calendar, service: &Service, span: &Span, now: Ms) -> Result<WorkWindow, EngineError> {
    let resource_id = cal.resource.id;
    if !cal.resource.bookable {
        return Err(EngineError::NotBookable(resource_id));
    }
    if !service.allows(&resource_id) {
        return Err(EngineError::ServiceMismatch {
            service_id: service.id,
            resource_id,
        });
    }
    if span.start < now {
        return Err(EngineError::PastTime);
    }
    let window = locate(cal, span).ok_or(EngineError::OutsideSchedule)?;
    check_within_window(&window, span)?;
    Ok(window)
}

/// Any active claim overlapping `span` is a conflict. `moving` is skipped so a
/// reschedule may overlap its own old interval.
pub(crate) fn check_no_conflict(cal: &Calendar, span: &Span, moving: Option<Ulid>) -> Result<(), EngineError> {
    match cal
        .overlapping(span)
        .find(|b| Some(b.appointment_id) != moving)
    {
        Some(b) => Err(EngineError::SlotTaken(b.appointment_id)),
        None => Ok(()),
    }
}
