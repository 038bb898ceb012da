//! Membership events for diagnostics and monitoring.
//!
//! Provides `MembershipEvent` and an `EventBus` that the coordinator, the
//! witness service and the monitor publish to. Nothing in the decision path
//! depends on subscribers; they only observe.

use crate::witness::{Resolution, Verdict};
use crate::{PeerId, RealmId, ReportId};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted while deciding whether peers are gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MembershipEvent {
    /// A disconnect started a grace period.
    #[serde(rename_all = "camelCase")]
    GraceEntered { peer_id: PeerId, realm: RealmId },
    /// A grace period elapsed without reconnection.
    #[serde(rename_all = "camelCase")]
    GraceExpired { peer_id: PeerId, realm: RealmId },
    /// The peer came back inside its grace period.
    #[serde(rename_all = "camelCase")]
    Recovered { peer_id: PeerId },
    /// The peer crossed the flap threshold; its state changes are suppressed.
    #[serde(rename_all = "camelCase")]
    FlappingDetected { peer_id: PeerId },
    /// A (re-)admission was refused.
    #[serde(rename_all = "camelCase")]
    AdmissionRejected { peer_id: PeerId, reason: String },
    /// A voting session was opened for a disconnect report.
    #[serde(rename_all = "camelCase")]
    ReportOpened {
        report_id: ReportId,
        target: PeerId,
        member_count: usize,
    },
    /// A disconnect report was dropped by the rate limiter.
    #[serde(rename_all = "camelCase")]
    ReportRateLimited { target: PeerId },
    /// A voting session reached its final verdict.
    #[serde(rename_all = "camelCase")]
    SessionResolved {
        report_id: ReportId,
        target: PeerId,
        verdict: Verdict,
        resolution: Resolution,
    },
    /// A member was removed from the realm.
    #[serde(rename_all = "camelCase")]
    MemberRemoved { peer_id: PeerId, graceful: bool },
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(MembershipEvent) + Send + Sync>;

/// Event bus for publishing membership events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(MembershipEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit never runs callbacks under the lock, so this cannot self-deadlock
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: MembershipEvent) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
