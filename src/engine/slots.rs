use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::schedule::{resolve, WorkWindow};
use super::{Engine, EngineError};

// ── Slot Algorithm ───────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

/// Working window minus the break minus busy intervals.
pub fn free_spans(window: &WorkWindow, busy: &[Span]) -> Vec<Span> {
    let mut blocked: Vec<Span> = busy.to_vec();
    blocked.extend(window.break_span);
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);
    subtract_intervals(&[window.span], &blocked)
}

/// Candidate intervals stepped by `duration` from the start of the window.
///
/// A candidate survives if it lies entirely in one free span and does not
/// start before `now`. Output is strictly increasing.
pub fn slot_starts(window: &WorkWindow, duration: Ms, busy: &[Span], now: Ms) -> Vec<Span> {
    if duration <= 0 {
        return Vec::new();
    }
    let free = free_spans(window, busy);
    let mut slots = Vec::new();
    let mut fi = 0;
    let mut start = window.span.start;

    while start + duration <= window.span.end {
        let candidate = Span::new(start, start + duration);
        // Free spans are disjoint and sorted: only the first one ending at or
        // after the candidate can contain it.
        while fi < free.len() && free[fi].end < candidate.end {
            fi += 1;
        }
        if fi == free.len() {
            break;
        }
        if candidate.start >= now && free[fi].contains_span(&candidate) {
            slots.push(candidate);
        }
        start += duration;
    }
    slots
}

impl Engine {
    /// Bookable intervals for `service_id` on `resource_id` on `date`.
    ///
    /// Pure read: holds the calendar read lock only while computing. An
    /// unknown, unbookable or ineligible resource has no slots.
    pub async fn available_slots(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        service_id: Ulid,
    ) -> Result<Vec<Span>, EngineError> {
        let service = self.service(&service_id)?;
        let Some(cal) = self.get_calendar(&resource_id) else {
            return Ok(Vec::new());
        };
        let guard = cal.read().await;
        if !guard.resource.bookable || !service.allows(&resource_id) {
            return Ok(Vec::new());
        }
        let Some(window) = resolve(&guard, date).window() else {
            return Ok(Vec::new());
        };
        let busy: Vec<Span> = guard.overlapping(&window.span).map(|b| b.span).collect();
        Ok(slot_starts(&window, service.duration_ms(), &busy, self.now()))
    }
}
