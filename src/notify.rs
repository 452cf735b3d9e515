//! Boundary to the external notification dispatcher.
//!
//! The engine hands over `(recipient, template, payload)` after a state change
//! has committed and never waits on or rolls back for the outcome.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    BookingConfirmed,
    BookingRescheduled,
    BookingCancelled,
    WaitlistOffer,
    WaitlistAccepted,
    /// Accepting failed; the entry is back in the queue at its old position.
    OfferWithdrawn,
    /// Declined or timed out; the entry left the queue.
    OfferExpired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipient_id: Ulid,
    pub kind: TemplateKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
#[error("notification dispatch failed: {0}")]
pub struct NotifyError(pub String);

pub trait Notifier: Send + Sync {
    fn dispatch(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// In-process dispatcher: one broadcast channel per recipient.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(recipient_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop a recipient's channel once its last receiver is gone.
    pub fn prune(&self, recipient_id: &Ulid) {
        self.channels
            .remove_if(recipient_id, |_, sender| sender.receiver_count() == 0);
    }
}

impl Notifier for NotifyHub {
    /// No-op if nobody is listening.
    fn dispatch(&self, notification: Notification) -> Result<(), NotifyError> {
        let recipient_id = notification.recipient_id;
        let orphaned = match self.channels.get(&recipient_id) {
            Some(sender) => sender.send(notification).is_err(),
            None => false,
        };
        if orphaned {
            self.prune(&recipient_id);
        }
        Ok(())
    }
}
