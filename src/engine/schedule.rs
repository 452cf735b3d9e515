//! Resolves the working window of a resource on a date.
//!
//! Precedence: a date override beats the weekly schedule; among weekly
//! schedules whose effective range covers the date, the most recently created
//! one wins. Wall-clock hours are converted to instants in the schedule's own
//! timezone.

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::warn;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkWindow {
    pub date: NaiveDate,
    pub timezone: Tz,
    pub span: Span,
    pub break_span: Option<Span>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Working(WorkWindow),
    NotWorking,
}

impl Resolution {
    pub fn window(self) -> Option<WorkWindow> {
        match self {
            Resolution::Working(w) => Some(w),
            Resolution::NotWorking => None,
        }
    }
}

pub fn resolve(cal: &Calendar, date: NaiveDate) -> Resolution {
    if let Some(o) = cal.overrides.get(&date) {
        return match &o.hours {
            Some(hours) => to_window(date, o.timezone, hours),
            None => Resolution::NotWorking,
        };
    }

    let mut active = cal.schedules.iter().filter(|s| s.is_active_on(date));
    let Some(mut chosen) = active.next() else {
        return Resolution::NotWorking;
    };
    let mut overlapping = false;
    for s in active {
        overlapping = true;
        // Later position breaks created_at ties.
        if s.created_at >= chosen.created_at {
            chosen = s;
        }
    }
    if overlapping {
        warn!(
            resource_id = %cal.resource.id,
            %date,
            schedule_id = %chosen.id,
            "overlapping schedules; using the most recently created"
        );
    }

    match chosen.entry_for(date) {
        Some(entry) => to_window(date, chosen.timezone, &entry.hours),
        None => Resolution::NotWorking,
    }
}

fn to_window(date: NaiveDate, timezone: Tz, hours: &DayHours) -> Resolution {
    let (Some(start), Some(end)) = (
        local_to_ms(timezone, date, hours.start),
        local_to_ms(timezone, date, hours.end),
    ) else {
        // An edge of the day falls in a DST gap.
        return Resolution::NotWorking;
    };
    if start >= end {
        return Resolution::NotWorking;
    }
    let break_span = hours.break_window.and_then(|(bs, be)| {
        let s = local_to_ms(timezone, date, bs)?;
        let e = local_to_ms(timezone, date, be)?;
        (s < e).then(|| Span::new(s, e))
    });
    Resolution::Working(WorkWindow {
        date,
        timezone,
        span: Span::new(start, end),
        break_span,
    })
}

/// Find the working window containing the start of `span`.
///
/// The local date of an instant depends on the timezone, so every timezone
/// the calendar uses is tried.
pub(crate) fn locate(cal: &Calendar, span: &Span) -> Option<WorkWindow> {
    let mut zones: Vec<Tz> = cal.schedules.iter().map(|s| s.timezone).collect();
    zones.extend(cal.overrides.values().map(|o| o.timezone));
    zones.sort_by_key(|tz| tz.name());
    zones.dedup();
    if zones.is_empty() {
        return None;
    }

    zones.into_iter().find_map(|tz| {
        let date = local_date(tz, span.start)?;
        resolve(cal, date)
            .window()
            .filter(|w| w.timezone == tz && w.span.contains_instant(span.start))
    })
}

impl Engine {
    pub async fn resolve_schedule(&self, resource_id: Ulid, date: NaiveDate) -> Result<Resolution, EngineError> {
        let cal = self
            .get_calendar(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = cal.read().await;
        Ok(resolve(&guard, date))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn hours(start: NaiveTime, end: NaiveTime) -> DayHours {
        DayHours { start, end, break_window: None }
    }

    fn schedule(from: NaiveDate, to: Option<NaiveDate>, tz: Tz, created_at: Ms, day: DayHours) -> Schedule {
        Schedule {
            id: Ulid::new(),
            resource_id: Ulid::nil(),
            effective_from: from,
            effective_to: to,
            timezone: tz,
            entries: (0..7).map(|dow| ScheduleEntry { day_of_week: dow, hours: day }).collect(),
            created_at,
        }
    }

    fn calendar() -> Calendar {
        Calendar::new(ResourceInfo { id: Ulid::nil(), name: None, bookable: true })
    }

    #[test]
    fn no_schedule_is_not_working() {
        assert_eq!(resolve(&calendar(), d(2026, 1, 5)), Resolution::NotWorking);
    }

    #[test]
    fn weekly_entry_with_break() {
        let mut cal = calendar();
        let mut s = schedule(d(2026, 1, 1), None, Tz::UTC, 0, hours(t(8, 0), t(12, 0)));
        s.entries = vec![ScheduleEntry {
            day_of_week: 1,
            hours: DayHours { start: t(8, 0), end: t(12, 0), break_window: Some((t(10, 0), t(10, 30))) },
        }];
        cal.schedules.push(s);

        let w = resolve(&cal, d(2026, 1, 5)).window().unwrap();
        assert_eq!(w.span.start, local_to_ms(Tz::UTC, d(2026, 1, 5), t(8, 0)).unwrap());
        assert_eq!(w.span.duration_ms(), 4 * 60 * MINUTE_MS);
        assert_eq!(w.break_span.unwrap().duration_ms(), 30 * MINUTE_MS);

        // Tuesday has no entry.
        assert_eq!(resolve(&cal, d(2026, 1, 6)), Resolution::NotWorking);
    }

    #[test]
    fn effective_range_bounds() {
        let mut cal = calendar();
        cal.schedules.push(schedule(d(2026, 1, 1), Some(d(2026, 1, 31)), Tz::UTC, 0, hours(t(9, 0), t(17, 0))));
        assert!(resolve(&cal, d(2025, 12, 31)).window().is_none());
        assert!(resolve(&cal, d(2026, 1, 31)).window().is_some());
        assert!(resolve(&cal, d(2026, 2, 1)).window().is_none());
    }

    #[test]
    fn override_beats_schedule() {
        let mut cal = calendar();
        cal.schedules.push(schedule(d(2026, 1, 1), None, Tz::UTC, 0, hours(t(9, 0), t(17, 0))));
        cal.overrides.insert(
            d(2026, 1, 5),
            ScheduleOverride { date: d(2026, 1, 5), timezone: Tz::UTC, hours: Some(hours(t(13, 0), t(15, 0))) },
        );
        cal.overrides.insert(d(2026, 1, 6), ScheduleOverride { date: d(2026, 1, 6), timezone: Tz::UTC, hours: None });

        let w = resolve(&cal, d(2026, 1, 5)).window().unwrap();
        assert_eq!(w.span.duration_ms(), 2 * 60 * MINUTE_MS);
        assert_eq!(resolve(&cal, d(2026, 1, 6)), Resolution::NotWorking);
        assert!(resolve(&cal, d(2026, 1, 7)).window().is_some());
    }

    #[test]
    fn most_recent_schedule_wins_on_overlap() {
        let mut cal = calendar();
        cal.schedules.push(schedule(d(2026, 1, 1), None, Tz::UTC, 10, hours(t(9, 0), t(17, 0))));
        cal.schedules.push(schedule(d(2026, 1, 1), None, Tz::UTC, 20, hours(t(7, 0), t(8, 0))));
        cal.schedules.push(schedule(d(2026, 1, 1), None, Tz::UTC, 5, hours(t(18, 0), t(19, 0))));

        let w = resolve(&cal, d(2026, 1, 5)).window().unwrap();
        assert_eq!(w.span.start, local_to_ms(Tz::UTC, d(2026, 1, 5), t(7, 0)).unwrap());
    }

    #[test]
    fn wall_clock_hours_follow_the_schedule_timezone() {
        let tz = chrono_tz::America::Asuncion;
        let mut cal = calendar();
        cal.schedules.push(schedule(d(2026, 1, 1), None, tz, 0, hours(t(8, 0), t(12, 0))));
        let w = resolve(&cal, d(2026, 1, 5)).window().unwrap();
        assert_eq!(w.span.start, local_to_ms(Tz::UTC, d(2026, 1, 5), t(11, 0)).unwrap());
    }

    #[test]
    fn dst_gap_edge_is_not_working() {
        // 2026-03-08 02:00-03:00 does not exist in New York.
        let tz = chrono_tz::America::New_York;
        let mut cal = calendar();
        cal.schedules.push(schedule(d(2026, 3, 1), None, tz, 0, hours(t(2, 30), t(6, 0))));
        assert_eq!(resolve(&cal, d(2026, 3, 8)), Resolution::NotWorking);
        assert!(resolve(&cal, d(2026, 3, 9)).window().is_some());
    }

    #[test]
    fn locate_uses_local_date() {
        // 22:00-23:30 in Asuncion is already the next day in UTC.
        let tz = chrono_tz::America::Asuncion;
        let mut cal = calendar();
        cal.schedules.push(schedule(d(2026, 1, 1), None, tz, 0, hours(t(22, 0), t(23, 30))));

        let start = local_to_ms(tz, d(2026, 1, 5), t(22, 30)).unwrap();
        let w = locate(&cal, &Span::new(start, start + 30 * MINUTE_MS)).unwrap();
        assert_eq!(w.date, d(2026, 1, 5));

        let early = local_to_ms(tz, d(2026, 1, 5), t(9, 0)).unwrap();
        assert!(locate(&cal, &Span::new(early, early + MINUTE_MS)).is_none());
    }
}
