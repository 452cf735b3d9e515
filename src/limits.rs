//! Hard limits enforced per tenant and per request.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_SERVICES_PER_TENANT: usize = 10_000;
pub const MAX_SCHEDULES_PER_RESOURCE: usize = 64;
pub const MAX_OVERRIDES_PER_RESOURCE: usize = 4_096;
pub const MAX_APPOINTMENTS_PER_RESOURCE: usize = 100_000;
pub const MAX_WAITLIST_ENTRIES: usize = 100_000;
pub const MAX_ELIGIBLE_RESOURCES: usize = 256;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_048;

/// A service longer than a day cannot fit any working window.
pub const MAX_SERVICE_DURATION_MIN: u32 = 24 * 60;

/// 1970-01-01 .. 2100-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const DEFAULT_OFFER_WINDOW_MS: Ms = 2 * 3_600_000;
