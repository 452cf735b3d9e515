use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn get_appointment(&self, id: &Ulid) -> Result<Appointment, EngineError> {
        self.appointment(id)
    }

    /// Appointments on a resource in start order, optionally limited to one
    /// local date. Terminal appointments are included.
    pub fn list_appointments(&self, resource_id: Ulid, date: Option<NaiveDate>) -> Vec<Appointment> {
        let mut result: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|a| a.resource_id == resource_id && date.is_none_or(|d| a.date == d))
            .map(|a| a.value().clone())
            .collect();
        result.sort_by_key(|a| (a.span.start, a.id));
        result
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let calendars: Vec<_> = self.calendars.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::with_capacity(calendars.len());
        for cal in calendars {
            result.push(cal.read().await.resource.clone());
        }
        result.sort_by_key(|r| r.id);
        result
    }

    pub fn list_services(&self) -> Vec<Service> {
        let mut result: Vec<Service> = self.services.iter().map(|s| s.value().clone()).collect();
        result.sort_by_key(|s| s.id);
        result
    }

    pub async fn list_schedules(&self, resource_id: Ulid) -> Result<Vec<Schedule>, EngineError> {
        let cal = self.calendar(&resource_id)?;
        let guard = cal.read().await;
        Ok(guard.schedules.clone())
    }

    /// Reads settle lapsed offers first, so an expired offer is never
    /// reported as open.
    pub async fn get_waitlist_entry(&self, id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let _tx = self.begin().await;
        let mut book = self.waitlist.lock().await;
        self.settle_lapsed(&mut book).await;
        book.entries.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// One (service, date) queue in position order, terminal entries included.
    pub async fn list_waitlist(&self, service_id: Ulid, date: NaiveDate) -> Vec<WaitlistEntry> {
        let _tx = self.begin().await;
        let mut book = self.waitlist.lock().await;
        self.settle_lapsed(&mut book).await;
        book.listing(service_id, date).into_iter().cloned().collect()
    }

    /// Events that recreate the current state. Terminal waitlist entries
    /// are dropped. Caller holds the commit gate exclusively.
    pub(super) async fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let book = self.waitlist.lock().await;
        let calendars: Vec<_> = self.calendars.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(calendars.len());
        for cal in &calendars {
            guards.push(cal.read().await);
        }

        for g in &guards {
            events.push(Event::ResourceCreated {
                resource: g.resource.clone(),
            });
        }
        for s in self.services.iter() {
            events.push(Event::ServiceUpserted {
                service: s.value().clone(),
            });
        }
        for g in &guards {
            for schedule in &g.schedules {
                events.push(Event::ScheduleCreated {
                    schedule: schedule.clone(),
                });
            }
            for o in g.overrides.values() {
                events.push(Event::OverrideSet {
                    resource_id: g.resource.id,
                    schedule_override: *o,
                });
            }
        }
        for a in self.appointments.iter() {
            events.push(Event::AppointmentBooked {
                appointment: a.value().clone(),
            });
        }

        let mut live: Vec<&WaitlistEntry> = book
            .entries
            .values()
            .filter(|e| !e.status.is_terminal())
            .collect();
        live.sort_by_key(|e| (e.service_id, e.preferred_date, e.position));
        events.extend(live.into_iter().map(|e| Event::WaitlistJoined { entry: e.clone() }));

        events
    }
}
