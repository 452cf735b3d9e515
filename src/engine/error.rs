use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{AppointmentStatus, WaitlistStatus};

/// How a caller should react to an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad request; retrying the same request fails the same way.
    Client,
    /// Lost a race for the slot; re-query availability and pick again.
    Contention,
    /// The store failed; retry with backoff.
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("slot taken: overlaps appointment {0}")]
    SlotTaken(Ulid),
    #[error("resource {0} is not bookable")]
    NotBookable(Ulid),
    #[error("service {service_id} cannot be performed by resource {resource_id}")]
    ServiceMismatch { service_id: Ulid, resource_id: Ulid },
    #[error("requested time is outside the resource's working hours")]
    OutsideSchedule,
    #[error("requested time is in the past")]
    PastTime,
    #[error("invalid schedule: {0}")]
    InvalidSchedule(&'static str),
    #[error("schedule {0} overlaps the effective range of an existing schedule")]
    ScheduleOverlap(Ulid),
    #[error("appointment cannot move from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("waitlist entry is {}, expected {expected}", .status.as_str())]
    InvalidWaitlistState {
        status: WaitlistStatus,
        expected: &'static str,
    },
    #[error("client already queued for this service on {date}: entry {existing}")]
    DuplicateWaitlistEntry { existing: Ulid, date: NaiveDate },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::SlotTaken(_) => ErrorClass::Contention,
            EngineError::Store(_) => ErrorClass::Infrastructure,
            _ => ErrorClass::Client,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Infrastructure
    }

    pub(crate) fn transition(from: AppointmentStatus, to: AppointmentStatus) -> Self {
        EngineError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        }
    }
}
