//! Waitlist queues and the offer cascade.
//!
//! Queues are keyed by (service, preferred date) and ordered by join
//! position. A freed interval is offered to one waiting entry at a time; a
//! decline or a lapsed deadline passes the same interval to the next entry.
//! Every transition happens under the waitlist lock, which is what keeps two
//! racing triggers from offering one interval twice.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::TemplateKind;
use crate::observability::{WAITLIST_EXPIRATIONS_TOTAL, WAITLIST_OFFERS_TOTAL};

use super::booking::{appointment_payload, BookingRequest, Origin};
use super::conflict::{check_no_conflict, check_placement};
use super::{Engine, EngineError};

type QueueKey = (Ulid, NaiveDate);

#[derive(Debug, Clone)]
pub struct WaitlistRequest {
    pub id: Ulid,
    pub client_id: Ulid,
    pub subject_id: Option<Ulid>,
    pub service_id: Ulid,
    pub preferred_date: NaiveDate,
    pub preferred_resource_id: Option<Ulid>,
}

#[derive(Debug, Default)]
pub(super) struct WaitlistBook {
    pub(super) entries: HashMap<Ulid, WaitlistEntry>,
    /// Waiting and offered entry ids per queue, ascending by position.
    queues: HashMap<QueueKey, Vec<Ulid>>,
    /// Terminal entry ids per queue, kept for listing only.
    closed: HashMap<QueueKey, Vec<Ulid>>,
    /// Highest position ever handed out per queue; never reused.
    last_position: HashMap<QueueKey, u64>,
    offered: HashSet<Ulid>,
    live: usize,
}

impl WaitlistBook {
    pub(super) fn apply(&mut self, event: &Event) {
        match event {
            Event::WaitlistJoined { entry } => {
                let key = (entry.service_id, entry.preferred_date);
                let last = self.last_position.entry(key).or_default();
                *last = (*last).max(entry.position);
                if self.entries.contains_key(&entry.id) {
                    return;
                }

                if entry.status.is_terminal() {
                    self.closed.entry(key).or_default().push(entry.id);
                } else {
                    let entries = &self.entries;
                    let queue = self.queues.entry(key).or_default();
                    let pos = queue.partition_point(|id| {
                        entries.get(id).is_some_and(|e| e.position < entry.position)
                    });
                    queue.insert(pos, entry.id);
                    self.live += 1;
                }
                if entry.status == WaitlistStatus::Offered {
                    self.offered.insert(entry.id);
                }
                self.entries.insert(entry.id, entry.clone());
            }
            Event::WaitlistOffered { id, slot, expires_at } => {
                if let Some(e) = self.entries.get_mut(id) {
                    e.status = WaitlistStatus::Offered;
                    e.offered_appointment_id = slot.appointment_id;
                    e.offered_resource_id = Some(slot.resource_id);
                    e.offered_span = Some(slot.span);
                    e.offer_expires_at = Some(*expires_at);
                    self.offered.insert(*id);
                }
            }
            Event::WaitlistReverted { id } => {
                if let Some(e) = self.entries.get_mut(id) {
                    e.status = WaitlistStatus::Waiting;
                    e.offered_appointment_id = None;
                    e.offered_resource_id = None;
                    e.offered_span = None;
                    e.offer_expires_at = None;
                }
                self.offered.remove(id);
            }
            Event::WaitlistClosed {
                id,
                status,
                booked_appointment_id,
            } => self.retire(*id, *status, *booked_appointment_id),
            Event::OfferAccepted { entry_id, appointment } => {
                self.retire(*entry_id, WaitlistStatus::Accepted, Some(appointment.id))
            }
            _ => {}
        }
    }

    /// Move an entry to a terminal status and out of its live queue.
    fn retire(&mut self, id: Ulid, status: WaitlistStatus, booked_appointment_id: Option<Ulid>) {
        self.offered.remove(&id);
        let Some(e) = self.entries.get_mut(&id) else {
            return;
        };
        let was_live = !e.status.is_terminal();
        e.status = status;
        e.booked_appointment_id = booked_appointment_id;
        if !was_live || !status.is_terminal() {
            return;
        }
        let key = (e.service_id, e.preferred_date);
        if let Some(queue) = self.queues.get_mut(&key) {
            queue.retain(|q| *q != id);
            if queue.is_empty() {
                self.queues.remove(&key);
            }
        }
        self.closed.entry(key).or_default().push(id);
        self.live -= 1;
    }

    fn next_position(&self, key: QueueKey) -> u64 {
        self.last_position.get(&key).copied().unwrap_or(0) + 1
    }

    fn find_live(&self, client_id: Ulid, service_id: Ulid, date: NaiveDate) -> Option<Ulid> {
        self.queue_entries(service_id, date)
            .find(|e| e.client_id == client_id)
            .map(|e| e.id)
    }

    fn live_count(&self) -> usize {
        self.live
    }

    /// Live entries of one queue in position order.
    fn queue_entries(&self, service_id: Ulid, date: NaiveDate) -> impl Iterator<Item = &WaitlistEntry> {
        self.queues
            .get(&(service_id, date))
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    /// Every entry of one queue, terminal ones included, in position order.
    pub(super) fn listing(&self, service_id: Ulid, date: NaiveDate) -> Vec<&WaitlistEntry> {
        let mut all: Vec<&WaitlistEntry> = self.queue_entries(service_id, date).collect();
        all.extend(
            self.closed
                .get(&(service_id, date))
                .into_iter()
                .flatten()
                .filter_map(|id| self.entries.get(id)),
        );
        all.sort_by_key(|e| e.position);
        all
    }

    /// Queues on `date`s accepted by `opened` with someone waiting who would
    /// take a slot on `resource_id`.
    fn waiting_for(&self, resource_id: Ulid, opened: impl Fn(NaiveDate) -> bool) -> Vec<QueueKey> {
        let mut keys: Vec<QueueKey> = self
            .queues
            .iter()
            .filter(|((_, date), _)| opened(*date))
            .filter(|(_, ids)| {
                ids.iter().filter_map(|id| self.entries.get(id)).any(|e| {
                    e.status == WaitlistStatus::Waiting
                        && e.preferred_resource_id.is_none_or(|r| r == resource_id)
                })
            })
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    /// Lowest-position waiting entry that would take this slot.
    fn next_waiting(&self, slot: &FreedSlot) -> Option<&WaitlistEntry> {
        self.queue_entries(slot.service_id, slot.date).find(|e| {
            e.status == WaitlistStatus::Waiting
                && e.preferred_resource_id.is_none_or(|r| r == slot.resource_id)
        })
    }

    /// The entry currently holding an offer for this interval, if any.
    fn holder_of(&self, slot: &FreedSlot) -> Option<Ulid> {
        self.offered.iter().copied().find(|id| {
            self.entries.get(id).is_some_and(|e| {
                e.offered_resource_id == Some(slot.resource_id) && e.offered_span == Some(slot.span)
            })
        })
    }

    /// Offers past their deadline, earliest deadline first.
    fn lapsed(&self, now: Ms) -> Vec<Ulid> {
        let mut lapsed: Vec<&WaitlistEntry> = self
            .offered
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| e.offer_lapsed(now))
            .collect();
        lapsed.sort_by_key(|e| (e.offer_expires_at, e.position));
        lapsed.into_iter().map(|e| e.id).collect()
    }

    fn get(&self, id: &Ulid) -> Result<&WaitlistEntry, EngineError> {
        self.entries.get(id).ok_or(EngineError::NotFound(*id))
    }
}

fn expect_status(entry: &WaitlistEntry, expected: WaitlistStatus) -> Result<(), EngineError> {
    if entry.status == expected {
        Ok(())
    } else {
        Err(EngineError::InvalidWaitlistState {
            status: entry.status,
            expected: expected.as_str(),
        })
    }
}

fn entry_payload(entry: &WaitlistEntry) -> serde_json::Value {
    serde_json::json!({
        "entry_id": entry.id.to_string(),
        "service_id": entry.service_id.to_string(),
        "preferred_date": entry.preferred_date.to_string(),
        "position": entry.position,
        "status": entry.status.as_str(),
    })
}

fn offer_payload(entry_id: Ulid, slot: &FreedSlot, expires_at: Ms) -> serde_json::Value {
    serde_json::json!({
        "entry_id": entry_id.to_string(),
        "resource_id": slot.resource_id.to_string(),
        "service_id": slot.service_id.to_string(),
        "date": slot.date.to_string(),
        "start": slot.span.start,
        "end": slot.span.end,
        "expires_at": expires_at,
    })
}

impl Engine {
    pub async fn join_waitlist(&self, request: WaitlistRequest) -> Result<WaitlistEntry, EngineError> {
        let _tx = self.begin().await;
        let service = self.service(&request.service_id)?;
        if let Some(rid) = request.preferred_resource_id {
            self.calendar(&rid)?;
            if !service.allows(&rid) {
                return Err(EngineError::ServiceMismatch {
                    service_id: service.id,
                    resource_id: rid,
                });
            }
        }

        let mut book = self.waitlist.lock().await;
        self.settle_lapsed(&mut book).await;
        if book.entries.contains_key(&request.id) {
            return Err(EngineError::AlreadyExists(request.id));
        }
        if let Some(existing) = book.find_live(request.client_id, request.service_id, request.preferred_date) {
            return Err(EngineError::DuplicateWaitlistEntry {
                existing,
                date: request.preferred_date,
            });
        }
        if book.live_count() >= MAX_WAITLIST_ENTRIES {
            return Err(EngineError::LimitExceeded("too many waitlist entries"));
        }

        let entry = WaitlistEntry {
            id: request.id,
            client_id: request.client_id,
            subject_id: request.subject_id,
            service_id: request.service_id,
            preferred_date: request.preferred_date,
            preferred_resource_id: request.preferred_resource_id,
            position: book.next_position((request.service_id, request.preferred_date)),
            status: WaitlistStatus::Waiting,
            offered_appointment_id: None,
            offered_resource_id: None,
            offered_span: None,
            offer_expires_at: None,
            booked_appointment_id: None,
        };
        let event = Event::WaitlistJoined { entry: entry.clone() };
        self.wal_append(&event).await?;
        book.apply(&event);
        info!(entry_id = %entry.id, service_id = %entry.service_id, date = %entry.preferred_date, position = entry.position, "joined waitlist");
        Ok(entry)
    }

    /// Turn an open offer into a booking of the offered interval.
    ///
    /// If the interval can no longer be booked the entry goes back to
    /// waiting at its old position and the interval moves down the queue.
    pub async fn accept_offer(&self, entry_id: Ulid) -> Result<Appointment, EngineError> {
        let _tx = self.begin().await;
        let mut book = self.waitlist.lock().await;
        self.settle_lapsed(&mut book).await;

        let entry = book.get(&entry_id)?.clone();
        expect_status(&entry, WaitlistStatus::Offered)?;
        let Some(slot) = entry.offered_slot() else {
            return Err(EngineError::InvalidWaitlistState {
                status: entry.status,
                expected: WaitlistStatus::Offered.as_str(),
            });
        };

        let request = BookingRequest {
            id: Ulid::new(),
            resource_id: slot.resource_id,
            service_id: entry.service_id,
            start: slot.span.start,
            client_id: entry.client_id,
            subject_id: entry.subject_id,
            notes: None,
        };
        let origin = Origin::Offer {
            entry_id,
            span: slot.span,
        };
        match self.book_locked(request, origin).await {
            Ok(appt) => {
                // Already durable as one record together with the booking.
                book.apply(&Event::OfferAccepted {
                    entry_id,
                    appointment: appt.clone(),
                });
                metrics::counter!(WAITLIST_OFFERS_TOTAL, "outcome" => "accepted").increment(1);
                info!(%entry_id, appointment_id = %appt.id, "offer accepted");
                self.notify(entry.client_id, TemplateKind::WaitlistAccepted, appointment_payload(&appt));
                Ok(appt)
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                let reverted = Event::WaitlistReverted { id: entry_id };
                self.wal_append(&reverted).await?;
                book.apply(&reverted);
                metrics::counter!(WAITLIST_OFFERS_TOTAL, "outcome" => "withdrawn").increment(1);
                info!(%entry_id, "offer withdrawn: {e}");
                self.notify(entry.client_id, TemplateKind::OfferWithdrawn, entry_payload(book.get(&entry_id)?));
                if let Err(ce) = self.cascade(&mut book, &slot).await {
                    warn!(%entry_id, "cascade after withdrawn offer: {ce}");
                }
                Err(e)
            }
        }
    }

    /// Decline an open offer. The entry leaves the queue and the interval
    /// is offered to the next one.
    pub async fn decline_offer(&self, entry_id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let _tx = self.begin().await;
        let mut book = self.waitlist.lock().await;
        self.settle_lapsed(&mut book).await;

        let entry = book.get(&entry_id)?;
        expect_status(entry, WaitlistStatus::Offered)?;
        let slot = entry.offered_slot();
        self.close(&mut book, entry_id, WaitlistStatus::Expired).await?;
        metrics::counter!(WAITLIST_OFFERS_TOTAL, "outcome" => "declined").increment(1);
        let closed = book.get(&entry_id)?.clone();
        self.notify(closed.client_id, TemplateKind::OfferExpired, entry_payload(&closed));

        if let Some(slot) = slot
            && let Err(e) = self.cascade(&mut book, &slot).await
        {
            warn!(%entry_id, "cascade after decline: {e}");
        }
        Ok(closed)
    }

    /// Client leaves the queue. An open offer is passed on.
    pub async fn cancel_waitlist_entry(&self, entry_id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let _tx = self.begin().await;
        let mut book = self.waitlist.lock().await;
        self.settle_lapsed(&mut book).await;

        let entry = book.get(&entry_id)?;
        if entry.status.is_terminal() {
            return Err(EngineError::InvalidWaitlistState {
                status: entry.status,
                expected: "waiting or offered",
            });
        }
        let open_offer = (entry.status == WaitlistStatus::Offered)
            .then(|| entry.offered_slot())
            .flatten();
        self.close(&mut book, entry_id, WaitlistStatus::Cancelled).await?;
        info!(%entry_id, "left waitlist");

        if let Some(slot) = open_offer
            && let Err(e) = self.cascade(&mut book, &slot).await
        {
            warn!(%entry_id, "cascade after cancel: {e}");
        }
        Ok(book.get(&entry_id)?.clone())
    }

    /// Active expiry. Returns how many offers were closed.
    pub async fn sweep_expired_offers(&self) -> usize {
        let _tx = self.begin().await;
        let mut book = self.waitlist.lock().await;
        self.settle_lapsed(&mut book).await
    }

    /// Entry point for a freed interval. Cascade failures are logged, never
    /// propagated: the cancellation that freed the slot has already committed.
    pub(super) async fn offer_freed_slot(&self, slot: FreedSlot) {
        let mut book = self.waitlist.lock().await;
        if let Err(e) = self.cascade(&mut book, &slot).await {
            warn!(appointment_id = ?slot.appointment_id, "waitlist cascade failed: {e}");
        }
    }

    /// Entry point for hours that opened on `resource_id`: a new schedule,
    /// added entries, an override, or the resource becoming bookable. Every
    /// free slot on a date accepted by `opened` is offered down its queue
    /// until the queue has no one left to take it. Failures are logged.
    pub(super) async fn offer_opened_slots(&self, resource_id: Ulid, opened: impl Fn(NaiveDate) -> bool) {
        let mut book = self.waitlist.lock().await;
        for (service_id, date) in book.waiting_for(resource_id, opened) {
            let spans = match self.available_slots(resource_id, date, service_id).await {
                Ok(spans) => spans,
                Err(e) => {
                    debug!(%service_id, %date, "opened slots: {e}");
                    continue;
                }
            };
            for span in spans {
                let slot = FreedSlot {
                    appointment_id: None,
                    resource_id,
                    service_id,
                    date,
                    span,
                };
                if book.next_waiting(&slot).is_none() {
                    break;
                }
                if let Err(e) = self.cascade(&mut book, &slot).await {
                    warn!(%resource_id, %date, "offering opened slot: {e}");
                    return;
                }
            }
        }
    }

    /// Expire every lapsed offer and pass each interval on. Runs before
    /// every waitlist read and mutation, and from the periodic sweep.
    pub(super) async fn settle_lapsed(&self, book: &mut WaitlistBook) -> usize {
        let lapsed = book.lapsed(self.now());
        let mut settled = 0;
        for id in lapsed {
            let Some(slot) = book.entries.get(&id).and_then(|e| e.offered_slot()) else {
                continue;
            };
            if let Err(e) = self.close(book, id, WaitlistStatus::Expired).await {
                warn!(entry_id = %id, "expiring offer: {e}");
                continue;
            }
            settled += 1;
            metrics::counter!(WAITLIST_EXPIRATIONS_TOTAL).increment(1);
            info!(entry_id = %id, "offer expired");
            if let Some(entry) = book.entries.get(&id) {
                self.notify(entry.client_id, TemplateKind::OfferExpired, entry_payload(entry));
            }
            if let Err(e) = self.cascade(book, &slot).await {
                warn!(entry_id = %id, "cascade after expiry: {e}");
            }
        }
        settled
    }

    /// Offer `slot` to the next waiting entry, unless it is already on offer
    /// or can no longer be booked. Returns the entry offered to.
    async fn cascade(&self, book: &mut WaitlistBook, slot: &FreedSlot) -> Result<Option<Ulid>, EngineError> {
        if let Some(holder) = book.holder_of(slot) {
            debug!(entry_id = %holder, "slot already on offer");
            return Ok(None);
        }
        if !self.slot_still_free(slot).await {
            debug!(resource_id = %slot.resource_id, start = slot.span.start, "freed slot no longer bookable");
            return Ok(None);
        }
        let Some(next) = book.next_waiting(slot) else {
            debug!(resource_id = %slot.resource_id, start = slot.span.start, "no one waiting; slot released");
            return Ok(None);
        };
        let (next_id, client_id) = (next.id, next.client_id);

        let expires_at = self.now() + self.config.offer_window_ms;
        let event = Event::WaitlistOffered {
            id: next_id,
            slot: *slot,
            expires_at,
        };
        self.wal_append(&event).await?;
        book.apply(&event);
        metrics::counter!(WAITLIST_OFFERS_TOTAL, "outcome" => "offered").increment(1);
        info!(entry_id = %next_id, resource_id = %slot.resource_id, start = slot.span.start, expires_at, "slot offered");
        self.notify(client_id, TemplateKind::WaitlistOffer, offer_payload(next_id, slot, expires_at));
        Ok(Some(next_id))
    }

    async fn slot_still_free(&self, slot: &FreedSlot) -> bool {
        let (Ok(service), Some(cal)) = (self.service(&slot.service_id), self.get_calendar(&slot.resource_id)) else {
            return false;
        };
        let guard = cal.read().await;
        check_placement(&guard, &service, &slot.span, self.now()).is_ok()
            && check_no_conflict(&guard, &slot.span, None).is_ok()
    }

    async fn close(&self, book: &mut WaitlistBook, id: Ulid, status: WaitlistStatus) -> Result<(), EngineError> {
        let event = Event::WaitlistClosed {
            id,
            status,
            booked_appointment_id: None,
        };
        self.wal_append(&event).await?;
        book.apply(&event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
    }

    fn entry(service_id: Ulid, date: NaiveDate, position: u64) -> WaitlistEntry {
        WaitlistEntry {
            id: Ulid::new(),
            client_id: Ulid::new(),
            subject_id: None,
            service_id,
            preferred_date: date,
            preferred_resource_id: None,
            position,
            status: WaitlistStatus::Waiting,
            offered_appointment_id: None,
            offered_resource_id: None,
            offered_span: None,
            offer_expires_at: None,
            booked_appointment_id: None,
        }
    }

    fn slot(service_id: Ulid, date: NaiveDate) -> FreedSlot {
        FreedSlot {
            appointment_id: Some(Ulid::new()),
            resource_id: Ulid::new(),
            service_id,
            date,
            span: Span::new(1_000, 2_000),
        }
    }

    #[test]
    fn queue_is_ordered_by_position_not_arrival() {
        let svc = Ulid::new();
        let mut book = WaitlistBook::default();
        let late = entry(svc, d(5), 3);
        let early = entry(svc, d(5), 1);
        book.apply(&Event::WaitlistJoined { entry: late.clone() });
        book.apply(&Event::WaitlistJoined { entry: early.clone() });

        let ids: Vec<Ulid> = book.queue_entries(svc, d(5)).map(|e| e.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
        assert_eq!(book.next_position((svc, d(5))), 4);
        assert_eq!(book.next_position((svc, d(6))), 1);
    }

    #[test]
    fn next_waiting_respects_preferred_resource() {
        let svc = Ulid::new();
        let s = slot(svc, d(5));
        let mut book = WaitlistBook::default();
        let mut picky = entry(svc, d(5), 1);
        picky.preferred_resource_id = Some(Ulid::new());
        let any = entry(svc, d(5), 2);
        book.apply(&Event::WaitlistJoined { entry: picky });
        book.apply(&Event::WaitlistJoined { entry: any.clone() });

        assert_eq!(book.next_waiting(&s).map(|e| e.id), Some(any.id));
        assert!(book.next_waiting(&slot(svc, d(6))).is_none());
    }

    #[test]
    fn offer_lifecycle_tracks_holder() {
        let svc = Ulid::new();
        let s = slot(svc, d(5));
        let mut book = WaitlistBook::default();
        let a = entry(svc, d(5), 1);
        book.apply(&Event::WaitlistJoined { entry: a.clone() });

        book.apply(&Event::WaitlistOffered { id: a.id, slot: s, expires_at: 500 });
        assert_eq!(book.holder_of(&s), Some(a.id));
        assert!(book.lapsed(499).is_empty());
        assert_eq!(book.lapsed(500), vec![a.id]);

        book.apply(&Event::WaitlistReverted { id: a.id });
        assert_eq!(book.holder_of(&s), None);
        let reverted = &book.entries[&a.id];
        assert_eq!(reverted.status, WaitlistStatus::Waiting);
        assert_eq!(reverted.position, 1);
        assert!(reverted.offered_span.is_none());
    }

    #[test]
    fn closed_entries_are_not_live() {
        let svc = Ulid::new();
        let mut book = WaitlistBook::default();
        let a = entry(svc, d(5), 1);
        book.apply(&Event::WaitlistJoined { entry: a.clone() });
        assert_eq!(book.find_live(a.client_id, svc, d(5)), Some(a.id));
        assert_eq!(book.live_count(), 1);

        book.apply(&Event::WaitlistClosed { id: a.id, status: WaitlistStatus::Cancelled, booked_appointment_id: None });
        assert_eq!(book.find_live(a.client_id, svc, d(5)), None);
        assert_eq!(book.live_count(), 0);
    }

    #[test]
    fn closed_entries_leave_the_live_queue_but_stay_listed() {
        let svc = Ulid::new();
        let mut book = WaitlistBook::default();
        let a = entry(svc, d(5), 1);
        let b = entry(svc, d(5), 2);
        let c = entry(svc, d(5), 3);
        for e in [&a, &b, &c] {
            book.apply(&Event::WaitlistJoined { entry: e.clone() });
        }
        book.apply(&Event::WaitlistClosed { id: b.id, status: WaitlistStatus::Expired, booked_appointment_id: None });
        // A repeated close does not count twice.
        book.apply(&Event::WaitlistClosed { id: b.id, status: WaitlistStatus::Expired, booked_appointment_id: None });
        assert_eq!(book.live_count(), 2);
        assert_eq!(book.queues[&(svc, d(5))], vec![a.id, c.id]);

        let listed: Vec<Ulid> = book.listing(svc, d(5)).iter().map(|e| e.id).collect();
        assert_eq!(listed, vec![a.id, b.id, c.id]);

        let appointment = Appointment {
            id: Ulid::new(),
            client_id: a.client_id,
            subject_id: None,
            resource_id: Ulid::new(),
            service_id: svc,
            date: d(5),
            span: Span::new(1_000, 2_000),
            status: AppointmentStatus::Requested,
            notes: None,
        };
        book.apply(&Event::OfferAccepted { entry_id: a.id, appointment: appointment.clone() });
        assert_eq!(book.live_count(), 1);
        assert_eq!(book.entries[&a.id].status, WaitlistStatus::Accepted);
        assert_eq!(book.entries[&a.id].booked_appointment_id, Some(appointment.id));
        assert_eq!(book.next_waiting(&slot(svc, d(5))).map(|e| e.id), Some(c.id));
    }
}
