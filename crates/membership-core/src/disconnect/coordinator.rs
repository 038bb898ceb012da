//! Anti-false-positive coordination for disconnect signals.
//!
//! The coordinator is the single place that decides what a disconnect
//! signal means for membership:
//! 1. A disconnect opens a grace period (default 15s)
//! 2. Reconnecting inside the grace period cancels the pending removal
//! 3. A peer that crosses the flap threshold has its state changes
//!    suppressed entirely until its transition window drains
//! 4. A peer that is still unreachable after its grace period (or after
//!    its flap verdict lapsed) gets a fresh grace period on the next signal
//! 5. A peer removed from the member list is protected from re-admission
//!    for a while (default 30s)
//!
//! Grace timers are spawned Tokio tasks. Each grace period carries a
//! generation number and the timer only acts if that generation is still
//! the current one, so a reconnect and an expiring timer can never both win.

use super::protection::DisconnectProtectionTracker;
use super::stability::{StabilityConfig, StabilityTracker};
use crate::events::{EventBus, MembershipEvent};
use crate::{PeerId, RealmId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the disconnect coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Delay before a disconnect becomes final (default: 15s).
    /// Zero disables the grace period.
    pub grace_period: Duration,
    /// Window flap transitions are counted in (default: 60s)
    pub flap_window: Duration,
    /// Transitions inside the window that make a peer flapping (default: 3)
    pub flap_threshold: usize,
    /// Re-admission protection after a confirmed removal (default: 30s)
    pub protection_duration: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(15),
            flap_window: Duration::from_secs(60),
            flap_threshold: 3,
            protection_duration: Duration::from_secs(30),
        }
    }
}

impl CoordinatorConfig {
    fn stability(&self) -> StabilityConfig {
        StabilityConfig {
            flap_window: self.flap_window,
            flap_threshold: self.flap_threshold,
        }
    }
}

/// Disconnect state of a peer as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectState {
    /// No pending decision (also the state of unknown peers)
    Stable,
    /// Disconnected, waiting for reconnection before removal
    GracePeriod,
    /// Cycling too fast; state changes are suppressed
    Flapping,
    /// Removed recently; re-admission is refused
    ProtectedAfterRemoval,
}

/// Result of a disconnect signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisconnectDecision {
    /// Remove the peer right away (grace period disabled)
    pub should_remove_now: bool,
    /// A new grace period was started for the peer
    pub entered_grace_period: bool,
}

/// Result of a reconnect signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectOutcome {
    /// The reconnect cancelled a pending grace period
    pub recovered: bool,
    /// The peer is flapping; further disconnects will be suppressed
    pub suppressed: bool,
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    Flapping,
    Protected,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flapping => "flapping",
            Self::Protected => "protected",
        }
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notice that a grace period elapsed without reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceExpired {
    pub peer_id: PeerId,
    pub realm: RealmId,
    /// Grace period this notice belongs to; see `is_expiry_current`
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Up,
    Down,
}

/// Per-peer bookkeeping. Only peers with a pending decision or a
/// flapping verdict have an entry.
#[derive(Debug)]
struct PeerDisconnectState {
    state: DisconnectState,
    link: Link,
    realm: Option<RealmId>,
    grace_deadline: Option<Instant>,
    generation: u64,
}

impl PeerDisconnectState {
    fn up() -> Self {
        Self {
            state: DisconnectState::Stable,
            link: Link::Up,
            realm: None,
            grace_deadline: None,
            generation: 0,
        }
    }
}

struct Inner {
    config: CoordinatorConfig,
    stability: StabilityTracker,
    protection: Arc<DisconnectProtectionTracker>,
    peers: DashMap<PeerId, PeerDisconnectState>,
    next_generation: AtomicU64,
    expired_tx: mpsc::UnboundedSender<GraceExpired>,
    events: Arc<EventBus>,
}

impl Inner {
    /// Timer callback. Acts only if the grace period it was armed for is
    /// still the current one.
    fn expire_grace(&self, peer_id: PeerId, generation: u64) {
        let realm = {
            let Some(mut state) = self.peers.get_mut(&peer_id) else {
                return;
            };
            if state.state != DisconnectState::GracePeriod || state.generation != generation {
                debug!("Stale grace timer for {} (generation {})", peer_id, generation);
                return;
            }
            // Link stays down so a later reconnect still counts as a transition
            state.state = DisconnectState::Stable;
            state.grace_deadline = None;
            state.realm.clone()
        };

        let Some(realm) = realm else {
            return;
        };

        info!("Grace period expired for {} in realm {}", peer_id, realm);
        self.events.emit(MembershipEvent::GraceExpired {
            peer_id,
            realm: realm.clone(),
        });
        let notice = GraceExpired {
            peer_id,
            realm,
            generation,
        };
        if self.expired_tx.send(notice).is_err() {
            debug!("Grace expiry receiver dropped, notice for {} discarded", peer_id);
        }
    }
}

/// Decides how disconnect and reconnect signals affect membership.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DisconnectCoordinator {
    inner: Arc<Inner>,
}

impl DisconnectCoordinator {
    /// Create a coordinator.
    ///
    /// Returns the receiver for grace expiry notices. Disconnect signals
    /// spawn timers and must be delivered from inside a Tokio runtime.
    pub fn new(
        config: CoordinatorConfig,
        events: Arc<EventBus>,
    ) -> (Self, mpsc::UnboundedReceiver<GraceExpired>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let protection = Arc::new(DisconnectProtectionTracker::new(config.protection_duration));

        let inner = Inner {
            stability: StabilityTracker::new(config.stability()),
            config,
            protection,
            peers: DashMap::new(),
            next_generation: AtomicU64::new(1),
            expired_tx,
            events,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            expired_rx,
        )
    }

    pub fn with_defaults() -> (Self, mpsc::UnboundedReceiver<GraceExpired>) {
        Self::new(CoordinatorConfig::default(), Arc::new(EventBus::new()))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// The protection tracker removals are recorded in.
    pub fn protection(&self) -> Arc<DisconnectProtectionTracker> {
        Arc::clone(&self.inner.protection)
    }

    pub fn stability(&self) -> &StabilityTracker {
        &self.inner.stability
    }

    /// Handle a disconnect signal, whatever detected it.
    pub fn on_peer_disconnected(&self, peer_id: PeerId, realm: &RealmId) -> DisconnectDecision {
        let inner = &self.inner;
        let now = Instant::now();

        if inner.protection.is_protected_at(&peer_id, now) {
            debug!("Ignoring disconnect of {}: already removed", peer_id);
            return DisconnectDecision::default();
        }

        let mut entry = inner.peers.entry(peer_id).or_insert_with(PeerDisconnectState::up);
        if entry.link == Link::Down {
            let state = entry.state;
            match state {
                DisconnectState::GracePeriod => {
                    // Several detectors often report the same loss
                    debug!("Duplicate disconnect signal for {}", peer_id);
                    return DisconnectDecision::default();
                }
                DisconnectState::Flapping if inner.stability.is_flapping_at(&peer_id, now) => {
                    debug!("Suppressed disconnect of flapping peer {}", peer_id);
                    return DisconnectDecision::default();
                }
                _ => {
                    // Grace already ran out or the flap verdict lapsed, and the
                    // link never came back. Not a transition.
                    debug!("Peer {} still unreachable, starting a new grace period", peer_id);
                    entry.realm = Some(realm.clone());
                    let timer = self.enter_grace(&mut entry, now);
                    drop(entry);
                    return self.arm_grace(peer_id, realm, timer);
                }
            }
        }

        entry.link = Link::Down;
        entry.realm = Some(realm.clone());

        if inner.stability.record_transition_at(peer_id, now) {
            let newly_flapping = entry.state != DisconnectState::Flapping;
            entry.state = DisconnectState::Flapping;
            entry.grace_deadline = None;
            drop(entry);

            if newly_flapping {
                warn!("Peer {} is flapping, suppressing state changes", peer_id);
                inner.events.emit(MembershipEvent::FlappingDetected { peer_id });
            } else {
                debug!("Suppressed disconnect of flapping peer {}", peer_id);
            }
            return DisconnectDecision::default();
        }

        let timer = self.enter_grace(&mut entry, now);
        drop(entry);
        self.arm_grace(peer_id, realm, timer)
    }

    /// Put a peer whose link is down into a grace period. Returns the
    /// timer to arm, or `None` when grace periods are disabled.
    fn enter_grace(&self, state: &mut PeerDisconnectState, now: Instant) -> Option<(Instant, u64)> {
        let inner = &self.inner;
        if inner.config.grace_period.is_zero() {
            state.state = DisconnectState::Stable;
            state.grace_deadline = None;
            return None;
        }

        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let deadline = now + inner.config.grace_period;
        state.state = DisconnectState::GracePeriod;
        state.grace_deadline = Some(deadline);
        state.generation = generation;
        Some((deadline, generation))
    }

    /// Spawn the grace timer chosen by `enter_grace`. Call without holding
    /// the peer's entry.
    fn arm_grace(
        &self,
        peer_id: PeerId,
        realm: &RealmId,
        timer: Option<(Instant, u64)>,
    ) -> DisconnectDecision {
        let Some((deadline, generation)) = timer else {
            return DisconnectDecision {
                should_remove_now: true,
                entered_grace_period: false,
            };
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_grace(peer_id, generation);
            }
        });

        info!(
            "Peer {} disconnected from realm {}, grace period {:?}",
            peer_id, realm, self.inner.config.grace_period
        );
        self.inner.events.emit(MembershipEvent::GraceEntered {
            peer_id,
            realm: realm.clone(),
        });

        DisconnectDecision {
            should_remove_now: false,
            entered_grace_period: true,
        }
    }

    /// Handle a reconnect signal.
    pub fn on_peer_reconnected(&self, peer_id: PeerId) -> ReconnectOutcome {
        let inner = &self.inner;
        let now = Instant::now();

        let (recovered, flapping) = match inner.peers.entry(peer_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().link == Link::Up {
                    // Never saw it go down; not a transition
                    let flapping = inner.stability.is_flapping_at(&peer_id, now);
                    (false, flapping)
                } else {
                    let recovered = occupied.get().state == DisconnectState::GracePeriod;
                    let flapping = inner.stability.record_transition_at(peer_id, now);
                    if flapping {
                        let state = occupied.get_mut();
                        state.link = Link::Up;
                        state.state = DisconnectState::Flapping;
                        state.grace_deadline = None;
                    } else {
                        occupied.remove();
                    }
                    (recovered, flapping)
                }
            }
            Entry::Vacant(_) => (false, inner.stability.is_flapping_at(&peer_id, now)),
        };

        if recovered {
            info!("Peer {} reconnected within grace period", peer_id);
            inner.events.emit(MembershipEvent::Recovered { peer_id });
        }
        if flapping {
            debug!("Peer {} reconnected while flapping", peer_id);
        }

        ReconnectOutcome {
            recovered,
            suppressed: flapping,
        }
    }

    /// Handle a graceful leave: no grace period, no corroboration.
    ///
    /// Returns true; a peer announcing its own departure is always removed.
    pub fn on_peer_left(&self, peer_id: PeerId) -> bool {
        self.inner.peers.remove(&peer_id);
        info!("Peer {} left gracefully", peer_id);
        true
    }

    /// Record that a peer was actually removed from the member list.
    pub fn on_member_removed(&self, peer_id: PeerId) {
        self.inner.peers.remove(&peer_id);
        self.inner.protection.on_member_removed(peer_id);
    }

    pub fn is_in_grace_period(&self, peer_id: &PeerId) -> bool {
        self.inner
            .peers
            .get(peer_id)
            .map(|s| s.state == DisconnectState::GracePeriod)
            .unwrap_or(false)
    }

    pub fn is_flapping(&self, peer_id: &PeerId) -> bool {
        self.inner.stability.is_flapping(peer_id)
    }

    /// When the pending removal of a peer becomes final.
    pub fn grace_deadline(&self, peer_id: &PeerId) -> Option<Instant> {
        self.inner.peers.get(peer_id).and_then(|s| s.grace_deadline)
    }

    /// Whether we currently believe the link to this peer is down.
    pub fn is_link_down(&self, peer_id: &PeerId) -> bool {
        self.inner
            .peers
            .get(peer_id)
            .map(|s| s.link == Link::Down)
            .unwrap_or(false)
    }

    /// Whether the peer's grace period is over (or was skipped) and it is
    /// still unreachable: the state in which a report about it may be open.
    pub fn is_pending_removal(&self, peer_id: &PeerId) -> bool {
        self.inner
            .peers
            .get(peer_id)
            .map(|s| s.link == Link::Down && s.state == DisconnectState::Stable)
            .unwrap_or(false)
    }

    /// Whether `notice` still describes the peer: no reconnect, flap or new
    /// grace period happened since it was sent.
    pub fn is_expiry_current(&self, notice: &GraceExpired) -> bool {
        self.inner
            .peers
            .get(&notice.peer_id)
            .map(|s| {
                s.link == Link::Down
                    && s.state == DisconnectState::Stable
                    && s.generation == notice.generation
            })
            .unwrap_or(false)
    }

    /// Current state of a peer. Unknown peers are `Stable`.
    pub fn state(&self, peer_id: &PeerId) -> DisconnectState {
        if self.inner.protection.is_protected(peer_id) {
            return DisconnectState::ProtectedAfterRemoval;
        }
        if self.is_in_grace_period(peer_id) {
            return DisconnectState::GracePeriod;
        }
        if self.is_flapping(peer_id) {
            return DisconnectState::Flapping;
        }
        DisconnectState::Stable
    }

    /// Check whether a peer may be (re-)admitted to membership.
    pub fn should_reject_add(&self, peer_id: &PeerId) -> Option<RejectReason> {
        if self.inner.stability.is_flapping(peer_id) {
            return Some(RejectReason::Flapping);
        }
        if self.inner.protection.is_protected(peer_id) {
            return Some(RejectReason::Protected);
        }
        None
    }

    /// Drop every grace, flap and protection record for a peer.
    pub fn clear_protection(&self, peer_id: &PeerId) {
        self.inner.peers.remove(peer_id);
        self.inner.stability.clear(peer_id);
        self.inner.protection.clear(peer_id);
        info!("Cleared disconnect protection for {}", peer_id);
    }

    /// Peers currently suppressed for flapping.
    pub fn flapping_peers(&self) -> Vec<PeerId> {
        self.inner.stability.flapping_peers()
    }

    /// Peers currently in a grace period.
    pub fn peers_in_grace_period(&self) -> Vec<PeerId> {
        self.inner
            .peers
            .iter()
            .filter(|s| s.state == DisconnectState::GracePeriod)
            .map(|s| *s.key())
            .collect()
    }

    /// Drop stale flap and protection records.
    ///
    /// A peer whose flap verdict lapsed while its link is down gets a grace
    /// period. Returns those peers with the decision taken for each.
    pub fn purge_expired(&self) -> Vec<(PeerId, DisconnectDecision)> {
        let inner = &self.inner;
        let now = Instant::now();
        inner.stability.purge_expired_at(now);
        inner.protection.purge_expired_at(now);
        // Flap verdicts for reachable peers are only kept while they hold
        inner.peers.retain(|peer_id, s| {
            !(s.state == DisconnectState::Flapping
                && s.link == Link::Up
                && !inner.stability.is_flapping_at(peer_id, now))
        });

        let lapsed: Vec<PeerId> = inner
            .peers
            .iter()
            .filter(|s| s.state == DisconnectState::Flapping && s.link == Link::Down)
            .map(|s| *s.key())
            .collect();

        let mut decisions = Vec::new();
        for peer_id in lapsed {
            let Some(mut entry) = inner.peers.get_mut(&peer_id) else {
                continue;
            };
            if entry.state != DisconnectState::Flapping
                || entry.link != Link::Down
                || inner.stability.is_flapping_at(&peer_id, now)
            {
                continue;
            }
            let Some(realm) = entry.realm.clone() else {
                continue;
            };
            info!("Flap verdict for {} lapsed while unreachable", peer_id);
            let timer = self.enter_grace(&mut entry, now);
            drop(entry);
            decisions.push((peer_id, self.arm_grace(peer_id, &realm, timer)));
        }
        decisions
    }
}
