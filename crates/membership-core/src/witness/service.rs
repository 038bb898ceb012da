//! Witness voting service.
//!
//! Turns suspected disconnects into voting sessions, feeds them votes from
//! other members, and commits confirmed verdicts to the member store.
//!
//! ## Flow
//!
//! 1. A detector reports a suspected disconnect (`on_peer_disconnected`)
//! 2. The rate limiter and the member store decide whether a session opens
//! 3. The report is broadcast; witnesses answer with confirmations
//! 4. The session resolves by rule, timeout or cancel
//! 5. A confirmed verdict removes the member and starts re-admission
//!    protection; the result is broadcast either way

use super::messages::{
    DetectionMethod, DisconnectReport, WitnessConfirmation, WitnessMessage, WitnessVotingResult,
};
use super::session::{DEFAULT_FAST_PATH_CUTOFF, VotingOutcome, VotingSession};
use crate::disconnect::{DisconnectCoordinator, RateLimitConfig, ReportRateLimiter};
use crate::events::{EventBus, MembershipEvent};
use crate::member::MemberManager;
use crate::transport::WitnessTransport;
use crate::{PeerId, RealmId, ReportId};
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for witness voting.
#[derive(Debug, Clone)]
pub struct WitnessConfig {
    /// Realms below this size confirm on one agreeing witness (default: 10)
    pub fast_path_cutoff: usize,
    /// Deadline for a session (default: 10s)
    pub vote_timeout: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            fast_path_cutoff: DEFAULT_FAST_PATH_CUTOFF,
            vote_timeout: Duration::from_secs(10),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// What happened to a disconnect report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDecision {
    /// A voting session was opened
    Opened(ReportId),
    /// A session about this target is still open
    Pending(ReportId),
    /// Graceful leave; the member was removed without a vote
    Left,
    /// Too many reports about this target recently
    RateLimited,
    /// Target is not (or no longer) a member
    NotMember,
    /// Target is the local peer
    SelfReport,
}

/// Runs voting sessions for disconnects this member observed.
pub struct WitnessService {
    local_id: PeerId,
    realm: RealmId,
    config: WitnessConfig,
    members: Arc<dyn MemberManager>,
    coordinator: DisconnectCoordinator,
    rate_limiter: ReportRateLimiter,
    sessions: DashMap<ReportId, Arc<VotingSession>>,
    transport: Arc<dyn WitnessTransport>,
    events: Arc<EventBus>,
}

impl WitnessService {
    pub fn new(
        local_id: PeerId,
        realm: RealmId,
        config: WitnessConfig,
        members: Arc<dyn MemberManager>,
        coordinator: DisconnectCoordinator,
        transport: Arc<dyn WitnessTransport>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            realm,
            rate_limiter: ReportRateLimiter::new(config.rate_limit.clone()),
            config,
            members,
            coordinator,
            sessions: DashMap::new(),
            transport,
            events,
        })
    }

    pub fn config(&self) -> &WitnessConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &ReportRateLimiter {
        &self.rate_limiter
    }

    /// Report a suspected disconnect of `target`.
    ///
    /// `last_contact_ms` is milliseconds since Unix epoch. Must be called
    /// from inside a Tokio runtime.
    pub fn on_peer_disconnected(
        self: &Arc<Self>,
        target: PeerId,
        method: DetectionMethod,
        last_contact_ms: u64,
    ) -> ReportDecision {
        if target == self.local_id {
            debug!("Ignoring disconnect report about ourselves");
            return ReportDecision::SelfReport;
        }

        if !self.members.is_member(&target) {
            debug!("Ignoring disconnect of {}: not a member", target);
            return ReportDecision::NotMember;
        }

        if method == DetectionMethod::GracefulLeave {
            self.remove_gracefully(target);
            return ReportDecision::Left;
        }

        if let Some(report_id) = self.open_session_for(target) {
            debug!("Report {} about {} still open", report_id, target);
            return ReportDecision::Pending(report_id);
        }

        if !self.rate_limiter.allow_report(target) {
            warn!(method = ?method, "Disconnect report for {} rate limited", target);
            self.events
                .emit(MembershipEvent::ReportRateLimited { target });
            return ReportDecision::RateLimited;
        }

        let member_count = self.members.total_count();
        let report_id = ReportId::generate();
        let (session, result_rx) = VotingSession::new(
            report_id,
            target,
            member_count,
            self.config.fast_path_cutoff,
        );
        self.sessions.insert(report_id, Arc::clone(&session));

        let service: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Ok(outcome) = result_rx.await
                && let Some(service) = service.upgrade()
            {
                service.commit(outcome);
            }
        });
        session.start_timeout(self.config.vote_timeout);

        info!(
            method = ?method,
            member_count,
            fast_path = session.is_fast_path(),
            "Opened report {} for {}",
            report_id,
            target
        );
        self.events.emit(MembershipEvent::ReportOpened {
            report_id,
            target,
            member_count,
        });

        self.broadcast(WitnessMessage::Report(DisconnectReport {
            report_id,
            reporter: self.local_id,
            target,
            realm: self.realm.clone(),
            method,
            last_contact_ms,
        }));

        ReportDecision::Opened(report_id)
    }

    /// Apply a witness's vote. Returns `false` if the vote was not counted.
    pub fn on_confirmation(&self, confirmation: &WitnessConfirmation) -> bool {
        let Some(session) = self
            .sessions
            .get(&confirmation.report_id)
            .map(|s| Arc::clone(s.value()))
        else {
            debug!("Vote for unknown report {}", confirmation.report_id);
            return false;
        };

        let witness = confirmation.witness_id;
        if witness == session.target() {
            debug!("Ignoring vote from {} about itself", witness);
            return false;
        }
        if witness == self.local_id || !self.members.is_member(&witness) {
            debug!("Ignoring vote from non-witness {}", witness);
            return false;
        }

        session.add_confirmation(witness, confirmation.vote);
        true
    }

    /// Apply another member's verdict. A confirmed result removes the
    /// target locally if it is still listed.
    pub fn on_voting_result(&self, result: &WitnessVotingResult) -> bool {
        if !result.confirmed {
            return false;
        }
        debug!(
            "Report {} confirmed {} gone",
            result.report_id, result.target_peer_id
        );
        self.cancel_for_target(result.target_peer_id);
        self.remove_member(result.target_peer_id, false)
    }

    /// Remove a member that announced it is leaving. No vote is held.
    pub fn remove_gracefully(&self, target: PeerId) -> bool {
        self.cancel_for_target(target);
        self.remove_member(target, true)
    }

    /// Cancel every open session about `target`. Returns how many were
    /// still open.
    pub fn cancel_for_target(&self, target: PeerId) -> usize {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .filter(|s| s.target() == target)
            .map(|s| Arc::clone(s.value()))
            .collect();

        let cancelled = sessions.iter().filter(|s| s.cancel().is_some()).count();
        if cancelled > 0 {
            info!("Cancelled {} report(s) for {}", cancelled, target);
        }
        cancelled
    }

    pub fn session(&self, report_id: &ReportId) -> Option<Arc<VotingSession>> {
        self.sessions.get(report_id).map(|s| Arc::clone(s.value()))
    }

    /// The unresolved session about `target`, if any.
    pub fn open_session_for(&self, target: PeerId) -> Option<ReportId> {
        self.sessions
            .iter()
            .find(|s| s.target() == target && !s.is_resolved())
            .map(|s| *s.key())
    }

    /// Reports still waiting for a verdict.
    pub fn open_sessions(&self) -> Vec<ReportId> {
        self.sessions
            .iter()
            .filter(|s| !s.is_resolved())
            .map(|s| *s.key())
            .collect()
    }

    pub fn purge_expired(&self) {
        self.rate_limiter.purge_expired();
    }

    fn commit(&self, outcome: VotingOutcome) {
        self.sessions.remove(&outcome.report_id);

        info!(
            verdict = ?outcome.verdict,
            resolution = ?outcome.resolution,
            agree = outcome.agree,
            disagree = outcome.disagree,
            "Report {} for {} resolved",
            outcome.report_id,
            outcome.target
        );
        self.events.emit(MembershipEvent::SessionResolved {
            report_id: outcome.report_id,
            target: outcome.target,
            verdict: outcome.verdict,
            resolution: outcome.resolution,
        });

        if outcome.is_confirmed() {
            self.remove_member(outcome.target, false);
        }

        self.broadcast(WitnessMessage::result(
            outcome.report_id,
            outcome.target,
            outcome.is_confirmed(),
        ));
    }

    fn remove_member(&self, target: PeerId, graceful: bool) -> bool {
        if target == self.local_id {
            return false;
        }
        if !self.members.is_member(&target) {
            debug!("{} already removed", target);
            return false;
        }

        match self.members.remove(&target) {
            Ok(()) => {
                self.coordinator.on_member_removed(target);
                info!(graceful, "Removed {} from {}", target, self.realm);
                self.events.emit(MembershipEvent::MemberRemoved {
                    peer_id: target,
                    graceful,
                });
                true
            }
            Err(e) => {
                warn!("Failed to remove {}: {}", target, e);
                false
            }
        }
    }

    fn broadcast(&self, message: WitnessMessage) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.broadcast(&message).await {
                warn!("Failed to broadcast {:?}: {}", message.report_id(), e);
            }
        });
    }
}
