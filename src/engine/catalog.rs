use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, IdSpace};

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_entries(entries: &[ScheduleEntry]) -> Result<(), EngineError> {
    let mut days = HashSet::new();
    for entry in entries {
        if entry.day_of_week > 6 {
            return Err(EngineError::InvalidSchedule("day_of_week must be 0..=6"));
        }
        if !days.insert(entry.day_of_week) {
            return Err(EngineError::InvalidSchedule("duplicate day_of_week"));
        }
        entry.hours.validate().map_err(EngineError::InvalidSchedule)?;
    }
    Ok(())
}

impl Engine {
    pub async fn create_resource(&self, resource: ResourceInfo) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        if self.calendars.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        check_name(&resource.name)?;
        let _claim = self.reserve(IdSpace::Resource, resource.id)?;
        if self.calendars.contains_key(&resource.id) {
            return Err(EngineError::AlreadyExists(resource.id));
        }

        let event = Event::ResourceCreated {
            resource: resource.clone(),
        };
        self.wal_append(&event).await?;
        info!(resource_id = %resource.id, bookable = resource.bookable, "resource created");
        self.calendars
            .insert(resource.id, Arc::new(RwLock::new(Calendar::new(resource))));
        Ok(())
    }

    /// Rename or soft-disable a resource. Existing appointments are kept;
    /// a non-bookable resource just stops accepting new ones.
    pub async fn update_resource(&self, resource: ResourceInfo) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        check_name(&resource.name)?;
        let cal = self.calendar(&resource.id)?;
        let mut guard = cal.write().await;
        let reopened = resource.bookable && !guard.resource.bookable;
        let resource_id = resource.id;
        let event = Event::ResourceUpdated { resource };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        if reopened {
            self.offer_opened_slots(resource_id, |_| true).await;
        }
        Ok(())
    }

    pub async fn create_service(&self, service: Service) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        if self.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let _claim = self.reserve(IdSpace::Service, service.id)?;
        if self.services.contains_key(&service.id) {
            return Err(EngineError::AlreadyExists(service.id));
        }
        self.upsert_service(service).await
    }

    /// Changing a duration only affects appointments booked afterwards.
    pub async fn update_service(&self, service: Service) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        if !self.services.contains_key(&service.id) {
            return Err(EngineError::NotFound(service.id));
        }
        self.upsert_service(service).await
    }

    async fn upsert_service(&self, service: Service) -> Result<(), EngineError> {
        check_name(&service.name)?;
        if service.duration_min == 0 || service.duration_min > MAX_SERVICE_DURATION_MIN {
            return Err(EngineError::LimitExceeded("service duration out of range"));
        }
        if service.eligible_resources.len() > MAX_ELIGIBLE_RESOURCES {
            return Err(EngineError::LimitExceeded("too many eligible resources"));
        }
        if let Some(missing) = service
            .eligible_resources
            .iter()
            .find(|r| !self.calendars.contains_key(r))
        {
            return Err(EngineError::NotFound(*missing));
        }

        let event = Event::ServiceUpserted {
            service: service.clone(),
        };
        self.wal_append(&event).await?;
        info!(service_id = %service.id, duration_min = service.duration_min, "service saved");
        self.services.insert(service.id, service);
        Ok(())
    }

    /// Add a weekly schedule. Effective ranges of one resource's schedules
    /// may not overlap.
    pub async fn create_schedule(&self, mut schedule: Schedule) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        if schedule.effective_to.is_some_and(|to| to < schedule.effective_from) {
            return Err(EngineError::InvalidSchedule("effective_to before effective_from"));
        }
        check_entries(&schedule.entries)?;
        let _claim = self.reserve(IdSpace::Schedule, schedule.id)?;
        if self.schedule_index.contains_key(&schedule.id) {
            return Err(EngineError::AlreadyExists(schedule.id));
        }

        let cal = self.calendar(&schedule.resource_id)?;
        let mut guard = cal.write().await;
        if guard.schedules.len() >= MAX_SCHEDULES_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many schedules on resource"));
        }
        if let Some(existing) = guard.schedules.iter().find(|s| s.overlaps_range(&schedule)) {
            return Err(EngineError::ScheduleOverlap(existing.id));
        }

        schedule.created_at = self.now();
        let (resource_id, from, to) = (schedule.resource_id, schedule.effective_from, schedule.effective_to);
        let event = Event::ScheduleCreated { schedule };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        self.offer_opened_slots(resource_id, |d| from <= d && to.is_none_or(|last| d <= last)).await;
        Ok(())
    }

    pub async fn add_schedule_entries(&self, schedule_id: Ulid, entries: Vec<ScheduleEntry>) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        let (resource_id, mut guard) = self.schedule_write(&schedule_id).await?;
        let existing = guard
            .schedules
            .iter()
            .find(|s| s.id == schedule_id)
            .ok_or(EngineError::NotFound(schedule_id))?;

        let mut merged = existing.entries.clone();
        merged.extend_from_slice(&entries);
        check_entries(&merged)?;
        let range = existing.clone();

        let event = Event::ScheduleEntriesAdded {
            schedule_id,
            resource_id,
            entries,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        self.offer_opened_slots(resource_id, |d| range.is_active_on(d)).await;
        Ok(())
    }

    pub async fn remove_schedule(&self, schedule_id: Ulid) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        let (resource_id, mut guard) = self.schedule_write(&schedule_id).await?;
        let event = Event::ScheduleRemoved {
            schedule_id,
            resource_id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Replace the working hours of one date. `hours = None` closes the day.
    pub async fn set_override(&self, resource_id: Ulid, schedule_override: ScheduleOverride) -> Result<(), EngineError> {
        let _tx = self.begin().await;
        if let Some(hours) = &schedule_override.hours {
            hours.validate().map_err(EngineError::InvalidSchedule)?;
        }
        let cal = self.calendar(&resource_id)?;
        let mut guard = cal.write().await;
        if guard.overrides.len() >= MAX_OVERRIDES_PER_RESOURCE
            && !guard.overrides.contains_key(&schedule_override.date)
        {
            return Err(EngineError::LimitExceeded("too many overrides on resource"));
        }
        let date = schedule_override.date;
        let event = Event::OverrideSet {
            resource_id,
            schedule_override,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        self.offer_opened_slots(resource_id, |d| d == date).await;
        Ok(())
    }

    /// Returns false if there was nothing to clear.
    pub async fn clear_override(&self, resource_id: Ulid, date: NaiveDate) -> Result<bool, EngineError> {
        let _tx = self.begin().await;
        let cal = self.calendar(&resource_id)?;
        let mut guard = cal.write().await;
        if !guard.overrides.contains_key(&date) {
            return Ok(false);
        }
        let event = Event::OverrideCleared { resource_id, date };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        self.offer_opened_slots(resource_id, |d| d == date).await;
        Ok(true)
    }

    /// Lookup schedule → resource, acquire the resource's write lock.
    async fn schedule_write(
        &self,
        schedule_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<Calendar>), EngineError> {
        let resource_id = self
            .schedule_index
            .get(schedule_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*schedule_id))?;
        let cal = self.calendar(&resource_id)?;
        Ok((resource_id, cal.write_owned().await))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;

    fn entry(day: u8, start: u32, end: u32) -> ScheduleEntry {
        ScheduleEntry {
            day_of_week: day,
            hours: DayHours {
                start: NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
                break_window: None,
            },
        }
    }

    #[test]
    fn entries_validated() {
        assert!(check_entries(&[entry(1, 8, 12), entry(2, 8, 12)]).is_ok());
        assert!(matches!(
            check_entries(&[entry(1, 8, 12), entry(1, 13, 17)]),
            Err(EngineError::InvalidSchedule("duplicate day_of_week"))
        ));
        assert!(check_entries(&[entry(7, 8, 12)]).is_err());
        assert!(check_entries(&[entry(3, 12, 8)]).is_err());
    }
}
