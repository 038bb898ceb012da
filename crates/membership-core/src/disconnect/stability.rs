//! Flap detection.
//!
//! Counts connect/disconnect transitions per peer inside a sliding window.
//! Once the count reaches the threshold the peer is "flapping" and state
//! changes for it should not be propagated until the window drains.

use crate::PeerId;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for flap detection.
#[derive(Debug, Clone)]
pub struct StabilityConfig {
    /// Sliding window transitions are counted in (default: 60s)
    pub flap_window: Duration,
    /// Transitions inside the window that make a peer flapping (default: 3)
    pub flap_threshold: usize,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            flap_window: Duration::from_secs(60),
            flap_threshold: 3,
        }
    }
}

/// Per-peer transition counter.
#[derive(Debug, Default)]
struct TransitionHistory {
    /// Oldest first
    transitions: VecDeque<Instant>,
}

impl TransitionHistory {
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.transitions.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.transitions.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.transitions
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < window)
            .count()
    }
}

/// Tracks connection transitions and flags flapping peers.
pub struct StabilityTracker {
    config: StabilityConfig,
    histories: DashMap<PeerId, TransitionHistory>,
}

impl StabilityTracker {
    pub fn new(config: StabilityConfig) -> Self {
        Self {
            config,
            histories: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(StabilityConfig::default())
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Record a connect or disconnect transition for a peer.
    pub fn record_transition(&self, peer_id: PeerId) {
        self.record_transition_at(peer_id, Instant::now());
    }

    /// Record a transition observed at `now`.
    ///
    /// Returns true if the peer is flapping after this transition.
    pub fn record_transition_at(&self, peer_id: PeerId, now: Instant) -> bool {
        let mut history = self.histories.entry(peer_id).or_default();
        history.purge(now, self.config.flap_window);
        history.transitions.push_back(now);

        // Anything past the threshold adds no information
        let cap = self.config.flap_threshold.max(1);
        while history.transitions.len() > cap {
            history.transitions.pop_front();
        }

        history.transitions.len() >= self.config.flap_threshold
    }

    /// Check if a peer is flapping.
    pub fn is_flapping(&self, peer_id: &PeerId) -> bool {
        self.is_flapping_at(peer_id, Instant::now())
    }

    pub fn is_flapping_at(&self, peer_id: &PeerId, now: Instant) -> bool {
        self.histories
            .get(peer_id)
            .map(|h| h.count_within(now, self.config.flap_window) >= self.config.flap_threshold)
            .unwrap_or(false)
    }

    /// Whether membership changes for this peer should be held back.
    ///
    /// Same verdict as [`is_flapping`](Self::is_flapping).
    pub fn should_suppress_state_change(&self, peer_id: &PeerId) -> bool {
        self.is_flapping(peer_id)
    }

    /// Snapshot of all currently flapping peers.
    pub fn flapping_peers(&self) -> Vec<PeerId> {
        self.flapping_peers_at(Instant::now())
    }

    pub fn flapping_peers_at(&self, now: Instant) -> Vec<PeerId> {
        self.histories
            .iter()
            .filter(|h| h.count_within(now, self.config.flap_window) >= self.config.flap_threshold)
            .map(|h| *h.key())
            .collect()
    }

    /// Number of transitions recorded inside the window.
    pub fn transition_count(&self, peer_id: &PeerId) -> usize {
        self.histories
            .get(peer_id)
            .map(|h| h.count_within(Instant::now(), self.config.flap_window))
            .unwrap_or(0)
    }

    /// Forget everything about a peer.
    pub fn clear(&self, peer_id: &PeerId) {
        self.histories.remove(peer_id);
    }

    /// Drop peers whose whole history has left the window.
    pub fn purge_expired(&self) {
        self.purge_expired_at(Instant::now());
    }

    pub fn purge_expired_at(&self, now: Instant) {
        let window = self.config.flap_window;
        self.histories.retain(|_, history| {
            history.purge(now, window);
            !history.transitions.is_empty()
        });
    }

    /// Number of peers with recorded transitions.
    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}

impl Default for StabilityTracker {
    fn default() -> Self {
        Self::with_defaults()
    }
}
