//! Re-admission protection after a confirmed removal.
//!
//! A peer that was just removed from the member list must not be added back
//! right away, or a stale "alive" signal racing the removal would make the
//! list oscillate.

use crate::PeerId;
use dashmap::DashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

/// Default protection window after removal.
pub const DEFAULT_PROTECTION_DURATION: Duration = Duration::from_secs(30);

/// Records when peers were removed and refuses re-admission for a while.
pub struct DisconnectProtectionTracker {
    duration: RwLock<Duration>,
    /// Peer → instant it was removed
    removed_at: DashMap<PeerId, Instant>,
}

impl DisconnectProtectionTracker {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration: RwLock::new(duration),
            removed_at: DashMap::new(),
        }
    }

    pub fn protection_duration(&self) -> Duration {
        *self.duration.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the protection window. Applies to already protected peers too.
    pub fn set_protection_duration(&self, duration: Duration) {
        *self.duration.write().unwrap_or_else(|e| e.into_inner()) = duration;
    }

    /// Start the protection window for a removed member.
    pub fn on_member_removed(&self, peer_id: PeerId) {
        self.on_member_removed_at(peer_id, Instant::now());
    }

    pub fn on_member_removed_at(&self, peer_id: PeerId, now: Instant) {
        self.removed_at.insert(peer_id, now);
    }

    /// Check if a peer is inside its protection window.
    pub fn is_protected(&self, peer_id: &PeerId) -> bool {
        self.is_protected_at(peer_id, Instant::now())
    }

    pub fn is_protected_at(&self, peer_id: &PeerId, now: Instant) -> bool {
        let duration = self.protection_duration();
        let protected = match self.removed_at.get(peer_id) {
            Some(removed_at) => now.saturating_duration_since(*removed_at) < duration,
            None => return false,
        };

        if !protected {
            self.removed_at
                .remove_if(peer_id, |_, removed_at| now.saturating_duration_since(*removed_at) >= duration);
        }
        protected
    }

    /// Time left in a peer's protection window.
    pub fn remaining(&self, peer_id: &PeerId) -> Option<Duration> {
        let now = Instant::now();
        let duration = self.protection_duration();
        self.removed_at
            .get(peer_id)
            .map(|removed_at| duration.saturating_sub(now.saturating_duration_since(*removed_at)))
            .filter(|left| !left.is_zero())
    }

    /// Lift protection for a peer immediately.
    pub fn clear(&self, peer_id: &PeerId) -> bool {
        self.removed_at.remove(peer_id).is_some()
    }

    /// Snapshot of all protected peers.
    pub fn protected_peers(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let duration = self.protection_duration();
        self.removed_at
            .iter()
            .filter(|e| now.saturating_duration_since(*e.value()) < duration)
            .map(|e| *e.key())
            .collect()
    }

    /// Drop entries whose window has elapsed.
    pub fn purge_expired(&self) {
        self.purge_expired_at(Instant::now());
    }

    pub fn purge_expired_at(&self, now: Instant) {
        let duration = self.protection_duration();
        self.removed_at
            .retain(|_, removed_at| now.saturating_duration_since(*removed_at) < duration);
    }

    pub fn len(&self) -> usize {
        self.removed_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.removed_at.is_empty()
    }
}

impl Default for DisconnectProtectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PROTECTION_DURATION)
    }
}
