//! DisconnectMonitor: routes detector signals and witness traffic.
//!
//! One monitor serves one realm on one member. It owns the coordinator and
//! the witness service and is the only thing detectors and the gossip layer
//! need to talk to:
//!
//! - Disconnect/reconnect/leave signals from transport, relay and liveness
//!   detectors
//! - Grace expiry notices (from the receiver returned by `new`)
//! - Witness messages from other members
//! - Admission checks before a peer is (re-)added

use crate::config::DisconnectConfig;
use crate::disconnect::{
    DisconnectCoordinator, DisconnectDecision, GraceExpired, ReconnectOutcome, RejectReason,
};
use crate::events::{EventBus, MembershipEvent};
use crate::member::MemberManager;
use crate::transport::WitnessTransport;
use crate::witness::{
    DetectionMethod, DisconnectReport, ReportDecision, Vote, WitnessMessage, WitnessService,
};
use crate::{PeerId, RealmId, ReportId};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Detection details held while a grace period runs.
#[derive(Debug, Clone, Copy)]
struct PendingReport {
    method: DetectionMethod,
    last_contact_ms: u64,
}

/// Point-in-time view for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub realm: RealmId,
    pub member_count: usize,
    pub in_grace_period: Vec<PeerId>,
    pub flapping: Vec<PeerId>,
    pub protected: Vec<PeerId>,
    pub open_sessions: Vec<ReportId>,
}

pub struct DisconnectMonitor {
    local_id: PeerId,
    realm: RealmId,
    coordinator: DisconnectCoordinator,
    witness: Arc<WitnessService>,
    members: Arc<dyn MemberManager>,
    transport: Arc<dyn WitnessTransport>,
    events: Arc<EventBus>,
    /// Peers we currently hold a live link to
    links: DashSet<PeerId>,
    pending: DashMap<PeerId, PendingReport>,
}

impl DisconnectMonitor {
    /// Create a monitor for `realm`.
    ///
    /// Feed every notice from the returned receiver to `on_grace_expired`.
    pub fn new(
        local_id: PeerId,
        realm: RealmId,
        config: &DisconnectConfig,
        members: Arc<dyn MemberManager>,
        transport: Arc<dyn WitnessTransport>,
        events: Arc<EventBus>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<GraceExpired>) {
        let (coordinator, expired_rx) =
            DisconnectCoordinator::new(config.coordinator(), Arc::clone(&events));
        let witness = WitnessService::new(
            local_id,
            realm.clone(),
            config.witness(),
            Arc::clone(&members),
            coordinator.clone(),
            Arc::clone(&transport),
            Arc::clone(&events),
        );

        let monitor = Self {
            local_id,
            realm,
            coordinator,
            witness,
            members,
            transport,
            events,
            links: DashSet::new(),
            pending: DashMap::new(),
        };
        (Arc::new(monitor), expired_rx)
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn realm(&self) -> &RealmId {
        &self.realm
    }

    pub fn coordinator(&self) -> &DisconnectCoordinator {
        &self.coordinator
    }

    pub fn witness(&self) -> &Arc<WitnessService> {
        &self.witness
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ==================== Detector signals ====================

    /// A detector lost contact with `peer_id`.
    pub fn on_peer_disconnected(
        &self,
        peer_id: PeerId,
        method: DetectionMethod,
        last_contact_ms: u64,
    ) -> DisconnectDecision {
        if method == DetectionMethod::GracefulLeave {
            self.on_peer_left(peer_id);
            return DisconnectDecision::default();
        }

        self.links.remove(&peer_id);
        // Recorded before the timer starts so an early expiry finds it. The
        // first detector's details are kept until the link comes back or a
        // report is raised.
        self.pending.entry(peer_id).or_insert(PendingReport {
            method,
            last_contact_ms,
        });

        let decision = self.coordinator.on_peer_disconnected(peer_id, &self.realm);
        if !self.coordinator.is_link_down(&peer_id) {
            // Already removed
            self.pending.remove(&peer_id);
        }

        if self.coordinator.is_flapping(&peer_id) {
            self.witness.cancel_for_target(peer_id);
            debug!(method = ?method, "Suppressed disconnect of flapping {}", peer_id);
            return decision;
        }

        self.apply(peer_id, decision);
        decision
    }

    /// A detector (re-)established contact with `peer_id`.
    pub fn on_peer_reconnected(&self, peer_id: PeerId) -> ReconnectOutcome {
        self.links.insert(peer_id);
        self.pending.remove(&peer_id);

        let outcome = self.coordinator.on_peer_reconnected(peer_id);
        self.witness.cancel_for_target(peer_id);

        if !outcome.suppressed {
            self.set_online(peer_id, true);
        }
        outcome
    }

    /// `peer_id` announced it is leaving. Removed at once, without a vote.
    pub fn on_peer_left(&self, peer_id: PeerId) -> bool {
        self.links.remove(&peer_id);
        self.pending.remove(&peer_id);
        self.coordinator.on_peer_left(peer_id);
        self.witness.remove_gracefully(peer_id)
    }

    /// Open a witness vote for a grace period that ran out.
    pub fn on_grace_expired(&self, notice: GraceExpired) -> Option<ReportDecision> {
        if notice.realm != self.realm {
            debug!("Grace expiry for other realm {}", notice.realm);
            return None;
        }

        let peer_id = notice.peer_id;
        if !self.coordinator.is_expiry_current(&notice) {
            debug!("Stale grace expiry for {}", peer_id);
            return None;
        }
        let Some((_, pending)) = self.pending.remove(&peer_id) else {
            debug!("No pending report for {}", peer_id);
            return None;
        };

        Some(self.open_report(peer_id, pending))
    }

    /// Act on a coordinator decision for a peer whose link is down.
    fn apply(&self, peer_id: PeerId, decision: DisconnectDecision) {
        if decision.entered_grace_period || decision.should_remove_now {
            self.set_online(peer_id, false);
        }
        if decision.should_remove_now
            && let Some((_, pending)) = self.pending.remove(&peer_id)
        {
            self.open_report(peer_id, pending);
        }
    }

    fn open_report(&self, peer_id: PeerId, pending: PendingReport) -> ReportDecision {
        let decision =
            self.witness
                .on_peer_disconnected(peer_id, pending.method, pending.last_contact_ms);

        // A reconnect may have landed between the checks and the session
        // insert, missing it when it cancelled.
        if matches!(decision, ReportDecision::Opened(_))
            && (self.links.contains(&peer_id) || !self.coordinator.is_pending_removal(&peer_id))
        {
            debug!("{} came back while its report opened", peer_id);
            self.witness.cancel_for_target(peer_id);
        }
        decision
    }

    // ==================== Witness traffic ====================

    /// Handle a witness message from another member.
    pub fn on_witness_message(&self, message: WitnessMessage) {
        match message {
            WitnessMessage::Report(report) => self.answer(&report),
            WitnessMessage::Confirmation(confirmation) => {
                self.witness.on_confirmation(&confirmation);
            }
            WitnessMessage::Result(result) => {
                if self.links.contains(&result.target_peer_id) {
                    debug!(
                        "Ignoring result {} about {}: still connected",
                        result.report_id, result.target_peer_id
                    );
                    return;
                }
                self.witness.on_voting_result(&result);
            }
        }
    }

    /// How this member votes on a report about `target`.
    pub fn judge(&self, target: PeerId) -> Vote {
        if target == self.local_id || self.links.contains(&target) {
            Vote::Disagree
        } else if self.coordinator.is_link_down(&target) {
            Vote::Agree
        } else {
            // No evidence either way
            Vote::Disagree
        }
    }

    fn answer(&self, report: &DisconnectReport) {
        if report.realm != self.realm || report.reporter == self.local_id {
            return;
        }

        let vote = self.judge(report.target);
        debug!(
            method = ?report.method,
            "Voting {:?} on report {} about {}",
            vote,
            report.report_id,
            report.target
        );

        let message = WitnessMessage::confirmation(self.local_id, report.report_id, vote);
        let reporter = report.reporter;
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.send_to(reporter, &message).await {
                warn!("Failed to send vote to {}: {}", reporter, e);
            }
        });
    }

    // ==================== Admission ====================

    /// Check whether `peer_id` may be added to the realm now.
    pub fn admit(&self, peer_id: PeerId) -> Result<(), RejectReason> {
        match self.coordinator.should_reject_add(&peer_id) {
            Some(reason) => {
                info!("Refusing to admit {}: {}", peer_id, reason);
                self.events.emit(MembershipEvent::AdmissionRejected {
                    peer_id,
                    reason: reason.to_string(),
                });
                Err(reason)
            }
            None => Ok(()),
        }
    }

    // ==================== Maintenance ====================

    pub fn purge_expired(&self) {
        for (peer_id, decision) in self.coordinator.purge_expired() {
            self.apply(peer_id, decision);
        }
        self.witness.purge_expired();
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let mut in_grace_period = self.coordinator.peers_in_grace_period();
        let mut flapping = self.coordinator.flapping_peers();
        let mut protected = self.coordinator.protection().protected_peers();
        in_grace_period.sort();
        flapping.sort();
        protected.sort();

        MonitorSnapshot {
            realm: self.realm.clone(),
            member_count: self.members.total_count(),
            in_grace_period,
            flapping,
            protected,
            open_sessions: self.witness.open_sessions(),
        }
    }

    fn set_online(&self, peer_id: PeerId, online: bool) {
        if !self.members.is_member(&peer_id) {
            return;
        }
        if let Err(e) = self.members.update_status(&peer_id, online) {
            warn!("Failed to update status of {}: {}", peer_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::RealmMembers;
    use crate::transport::{ChannelTransport, Outbound};
    use crate::witness::{Resolution, WitnessConfirmation, WitnessVotingResult};
    use crate::member::MemberError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, OnceLock, Weak};
    use std::time::Duration;

    fn local() -> PeerId {
        PeerId::from(0xaaaa)
    }

    fn peer(n: u64) -> PeerId {
        PeerId::from(0x1000 + n)
    }

    fn realm() -> RealmId {
        RealmId::new("home").unwrap()
    }

    struct Harness {
        monitor: Arc<DisconnectMonitor>,
        members: Arc<RealmMembers>,
        expired: mpsc::UnboundedReceiver<GraceExpired>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    }

    /// Local peer plus peer(0)..peer(4), all connected.
    fn harness(config: DisconnectConfig) -> Harness {
        let members = Arc::new(RealmMembers::new(local()));
        let (transport, outbound) = ChannelTransport::new();
        let (monitor, expired) = DisconnectMonitor::new(
            local(),
            realm(),
            &config,
            members.clone(),
            Arc::new(transport),
            Arc::new(EventBus::new()),
        );
        for i in 0..5 {
            members.add(peer(i));
            monitor.on_peer_reconnected(peer(i));
        }
        Harness {
            monitor,
            members,
            expired,
            outbound,
        }
    }

    fn no_grace() -> DisconnectConfig {
        DisconnectConfig {
            grace_period_ms: 0,
            ..Default::default()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn report_from(outbound: &[Outbound]) -> DisconnectReport {
        outbound
            .iter()
            .find_map(|o| match &o.message {
                WitnessMessage::Report(r) => Some(r.clone()),
                _ => None,
            })
            .expect("no report broadcast")
    }

    // ==================== Grace period flow ====================

    #[tokio::test(start_paused = true)]
    async fn test_expired_grace_opens_report_and_confirms() {
        let mut h = harness(DisconnectConfig::default());
        let target = peer(0);

        let decision = h
            .monitor
            .on_peer_disconnected(target, DetectionMethod::IdleTimeout, 123);
        assert!(decision.entered_grace_period);
        assert!(!h.members.is_online(&target));
        settle().await;
        assert!(drain(&mut h.outbound).is_empty());

        tokio::time::advance(Duration::from_secs(16)).await;
        let notice = h.expired.recv().await.unwrap();
        assert!(matches!(
            h.monitor.on_grace_expired(notice),
            Some(ReportDecision::Opened(_))
        ));
        settle().await;

        let report = report_from(&drain(&mut h.outbound));
        assert_eq!(report.target, target);
        assert_eq!(report.method, DetectionMethod::IdleTimeout);
        assert_eq!(report.last_contact_ms, 123);

        // Six members: fast path
        h.monitor
            .on_witness_message(WitnessMessage::Confirmation(WitnessConfirmation {
                witness_id: peer(1),
                report_id: report.report_id,
                vote: Vote::Agree,
            }));
        settle().await;

        assert!(!h.members.is_member(&target));
        assert_eq!(h.monitor.admit(target), Err(RejectReason::Protected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_signal_keeps_first_details() {
        let mut h = harness(DisconnectConfig::default());
        let target = peer(0);

        h.monitor
            .on_peer_disconnected(target, DetectionMethod::RelayCircuitClosed, 7);
        let duplicate = h
            .monitor
            .on_peer_disconnected(target, DetectionMethod::LivenessTimeout, 9);
        assert_eq!(duplicate, DisconnectDecision::default());

        tokio::time::advance(Duration::from_secs(16)).await;
        let notice = h.expired.recv().await.unwrap();
        assert!(matches!(
            h.monitor.on_grace_expired(notice),
            Some(ReportDecision::Opened(_))
        ));
        settle().await;

        let report = report_from(&drain(&mut h.outbound));
        assert_eq!(report.method, DetectionMethod::RelayCircuitClosed);
        assert_eq!(report.last_contact_ms, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_in_grace_recovers() {
        let mut h = harness(DisconnectConfig::default());
        let target = peer(0);

        h.monitor
            .on_peer_disconnected(target, DetectionMethod::LivenessTimeout, 0);
        tokio::time::advance(Duration::from_secs(5)).await;

        let outcome = h.monitor.on_peer_reconnected(target);
        assert!(outcome.recovered);
        assert!(h.members.is_online(&target));

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert!(h.expired.try_recv().is_err());
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_after_reconnect_ignored() {
        let h = harness(DisconnectConfig::default());
        let target = peer(0);

        h.monitor
            .on_peer_disconnected(target, DetectionMethod::IdleTimeout, 0);
        h.monitor.on_peer_reconnected(target);

        let notice = GraceExpired {
            peer_id: target,
            realm: realm(),
            generation: 1,
        };
        assert_eq!(h.monitor.on_grace_expired(notice), None);
        assert!(h.monitor.witness().open_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_from_earlier_grace_period_ignored() {
        let mut h = harness(DisconnectConfig {
            flap_threshold: 10,
            ..Default::default()
        });
        let target = peer(0);

        h.monitor
            .on_peer_disconnected(target, DetectionMethod::IdleTimeout, 0);
        let old = h.expired.recv().await.unwrap();
        h.monitor.on_peer_reconnected(target);
        h.monitor
            .on_peer_disconnected(target, DetectionMethod::RelayCircuitClosed, 5);

        // Reconnect and a new loss happened since; the new grace period decides
        assert_eq!(h.monitor.on_grace_expired(old), None);
        assert!(h.monitor.witness().open_sessions().is_empty());

        let current = h.expired.recv().await.unwrap();
        assert!(matches!(
            h.monitor.on_grace_expired(current),
            Some(ReportDecision::Opened(_))
        ));
        settle().await;
        let report = report_from(&drain(&mut h.outbound));
        assert_eq!(report.method, DetectionMethod::RelayCircuitClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_for_other_realm_ignored() {
        let h = harness(DisconnectConfig::default());
        let notice = GraceExpired {
            peer_id: peer(0),
            realm: RealmId::new("elsewhere").unwrap(),
            generation: 1,
        };
        assert_eq!(h.monitor.on_grace_expired(notice), None);
    }

    // ==================== Sessions ====================

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_open_session() {
        let h = harness(no_grace());
        let target = peer(0);

        let decision = h
            .monitor
            .on_peer_disconnected(target, DetectionMethod::RelayCircuitClosed, 0);
        assert!(decision.should_remove_now);
        let report_id = h.monitor.witness().open_sessions()[0];
        let session = h.monitor.witness().session(&report_id).unwrap();

        h.monitor.on_peer_reconnected(target);
        settle().await;

        assert_eq!(session.outcome().unwrap().resolution, Resolution::Cancelled);
        assert!(h.members.is_member(&target));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_peer_gets_no_report() {
        let h = harness(no_grace());
        let target = peer(0);

        // The initial connect in the harness is not a transition
        h.monitor
            .on_peer_disconnected(target, DetectionMethod::IdleTimeout, 0);
        h.monitor.on_peer_reconnected(target);
        let decision = h
            .monitor
            .on_peer_disconnected(target, DetectionMethod::IdleTimeout, 0);

        assert!(h.monitor.coordinator().is_flapping(&target));
        assert_eq!(decision, DisconnectDecision::default());
        settle().await;

        assert!(h.monitor.witness().open_sessions().is_empty());
        assert!(h.members.is_member(&target));
        assert_eq!(h.monitor.admit(target), Err(RejectReason::Flapping));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_peer_still_down_is_reported_again() {
        let mut h = harness(DisconnectConfig::default());
        let target = peer(0);

        h.monitor
            .on_peer_disconnected(target, DetectionMethod::IdleTimeout, 0);
        let notice = h.expired.recv().await.unwrap();
        let first = match h.monitor.on_grace_expired(notice) {
            Some(ReportDecision::Opened(id)) => id,
            other => panic!("Expected report, got {:?}", other),
        };

        // Nobody answers: rejected at the deadline
        tokio::time::advance(Duration::from_secs(11)).await;
        settle().await;
        assert!(h.monitor.witness().open_sessions().is_empty());
        assert!(h.members.is_member(&target));
        drain(&mut h.outbound);

        tokio::time::advance(Duration::from_secs(120)).await;
        let decision = h
            .monitor
            .on_peer_disconnected(target, DetectionMethod::LivenessTimeout, 9);
        assert!(decision.entered_grace_period);

        let notice = h.expired.recv().await.unwrap();
        let second = match h.monitor.on_grace_expired(notice) {
            Some(ReportDecision::Opened(id)) => id,
            other => panic!("Expected report, got {:?}", other),
        };
        assert_ne!(first, second);
        settle().await;

        let report = report_from(&drain(&mut h.outbound));
        assert_eq!(report.method, DetectionMethod::LivenessTimeout);
        assert_eq!(report.last_contact_ms, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_peer_that_stays_down_is_reported() {
        let mut h = harness(DisconnectConfig::default());
        let target = peer(0);

        h.monitor
            .on_peer_disconnected(target, DetectionMethod::IdleTimeout, 0);
        h.monitor.on_peer_reconnected(target);
        h.monitor
            .on_peer_disconnected(target, DetectionMethod::IdleTimeout, 3);
        assert!(h.monitor.coordinator().is_flapping(&target));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(!h.monitor.coordinator().is_flapping(&target));

        let decision = h
            .monitor
            .on_peer_disconnected(target, DetectionMethod::LivenessTimeout, 0);
        assert!(decision.entered_grace_period);
        assert!(h.monitor.coordinator().is_in_grace_period(&target));
        assert!(!h.members.is_online(&target));

        let notice = h.expired.recv().await.unwrap();
        assert!(matches!(
            h.monitor.on_grace_expired(notice),
            Some(ReportDecision::Opened(_))
        ));
        settle().await;

        let report = report_from(&drain(&mut h.outbound));
        assert_eq!(report.target, target);
        assert_eq!(report.last_contact_ms, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_starts_grace_for_silent_flapping_peer() {
        let mut h = harness(DisconnectConfig::default());
        let target = peer(0);

        h.monitor
            .on_peer_disconnected(target, DetectionMethod::IdleTimeout, 0);
        h.monitor.on_peer_reconnected(target);
        h.monitor
            .on_peer_disconnected(target, DetectionMethod::RelayCircuitClosed, 4);

        // No further signals ever arrive
        tokio::time::advance(Duration::from_secs(61)).await;
        h.monitor.purge_expired();
        assert!(h.monitor.coordinator().is_in_grace_period(&target));
        assert!(!h.members.is_online(&target));

        let notice = h.expired.recv().await.unwrap();
        assert!(matches!(
            h.monitor.on_grace_expired(notice),
            Some(ReportDecision::Opened(_))
        ));
        settle().await;

        let report = report_from(&drain(&mut h.outbound));
        assert_eq!(report.method, DetectionMethod::RelayCircuitClosed);
    }

    /// Member store that reconnects `target` the moment a report about it
    /// reads the realm size, after the service checks and before the session
    /// is stored.
    struct ReconnectWhileOpening {
        inner: RealmMembers,
        target: PeerId,
        monitor: OnceLock<Weak<DisconnectMonitor>>,
        fired: AtomicBool,
    }

    impl MemberManager for ReconnectWhileOpening {
        fn is_member(&self, peer_id: &PeerId) -> bool {
            self.inner.is_member(peer_id)
        }

        fn total_count(&self) -> usize {
            if !self.fired.swap(true, Ordering::SeqCst)
                && let Some(monitor) = self.monitor.get().and_then(Weak::upgrade)
            {
                monitor.on_peer_reconnected(self.target);
            }
            self.inner.total_count()
        }

        fn remove(&self, peer_id: &PeerId) -> Result<(), MemberError> {
            self.inner.remove(peer_id)
        }

        fn update_status(&self, peer_id: &PeerId, online: bool) -> Result<(), MemberError> {
            self.inner.update_status(peer_id, online)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_while_report_opens_cancels_it() {
        let target = peer(0);
        let members = Arc::new(ReconnectWhileOpening {
            inner: RealmMembers::new(local()),
            target,
            monitor: OnceLock::new(),
            fired: AtomicBool::new(false),
        });
        for i in 0..5 {
            members.inner.add(peer(i));
        }

        let (transport, _outbound) = ChannelTransport::new();
        let (monitor, mut expired) = DisconnectMonitor::new(
            local(),
            realm(),
            &DisconnectConfig::default(),
            members.clone(),
            Arc::new(transport),
            Arc::new(EventBus::new()),
        );
        let _ = members.monitor.set(Arc::downgrade(&monitor));

        monitor.on_peer_disconnected(target, DetectionMethod::IdleTimeout, 0);
        let notice = expired.recv().await.unwrap();
        let report_id = match monitor.on_grace_expired(notice) {
            Some(ReportDecision::Opened(id)) => id,
            other => panic!("Expected report, got {:?}", other),
        };
        assert!(members.fired.load(Ordering::SeqCst));

        let session = monitor.witness().session(&report_id).unwrap();
        assert_eq!(session.outcome().unwrap().resolution, Resolution::Cancelled);
        assert!(monitor.witness().open_sessions().is_empty());

        // A late agreeing vote cannot remove the reconnected peer
        monitor.on_witness_message(WitnessMessage::confirmation(
            peer(1),
            report_id,
            Vote::Agree,
        ));
        settle().await;
        assert!(members.is_member(&target));
        assert!(members.inner.is_online(&target));
    }

    // ==================== Witness answering ====================

    fn report_about(target: PeerId, realm: RealmId) -> DisconnectReport {
        DisconnectReport {
            report_id: ReportId::generate(),
            reporter: peer(1),
            target,
            realm,
            method: DetectionMethod::IdleTimeout,
            last_contact_ms: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_reports() {
        let mut h = harness(DisconnectConfig::default());

        h.monitor
            .on_peer_disconnected(peer(2), DetectionMethod::IdleTimeout, 0);

        let cases = [
            (peer(0), Vote::Disagree), // live link
            (peer(2), Vote::Agree),    // lost it too
            (local(), Vote::Disagree),
            (peer(99), Vote::Disagree), // never seen
        ];
        for (target, expected) in cases {
            let report = report_about(target, realm());
            h.monitor
                .on_witness_message(WitnessMessage::Report(report.clone()));
            settle().await;

            let sent = drain(&mut h.outbound);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].to, Some(peer(1)));
            assert_eq!(
                sent[0].message,
                WitnessMessage::confirmation(local(), report.report_id, expected)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_for_other_realm_unanswered() {
        let mut h = harness(DisconnectConfig::default());
        let report = report_about(peer(0), RealmId::new("elsewhere").unwrap());

        h.monitor.on_witness_message(WitnessMessage::Report(report));
        settle().await;
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_result_ignored_while_connected() {
        let h = harness(DisconnectConfig::default());
        let result = |target| {
            WitnessMessage::Result(WitnessVotingResult {
                report_id: ReportId::generate(),
                target_peer_id: target,
                confirmed: true,
            })
        };

        h.monitor.on_witness_message(result(peer(0)));
        assert!(h.members.is_member(&peer(0)));

        h.monitor
            .on_peer_disconnected(peer(0), DetectionMethod::IdleTimeout, 0);
        h.monitor.on_witness_message(result(peer(0)));
        assert!(!h.members.is_member(&peer(0)));
        assert!(h.monitor.coordinator().protection().is_protected(&peer(0)));
    }

    // ==================== Leave and admission ====================

    #[tokio::test(start_paused = true)]
    async fn test_graceful_leave() {
        let mut h = harness(DisconnectConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = h
            .monitor
            .events()
            .subscribe(move |e| sink.lock().unwrap().push(e));

        h.monitor
            .on_peer_disconnected(peer(0), DetectionMethod::GracefulLeave, 0);
        settle().await;

        assert!(!h.members.is_member(&peer(0)));
        assert!(!h.monitor.coordinator().is_in_grace_period(&peer(0)));
        assert!(drain(&mut h.outbound).is_empty());

        assert_eq!(h.monitor.admit(peer(0)), Err(RejectReason::Protected));
        h.monitor.coordinator().clear_protection(&peer(0));
        assert_eq!(h.monitor.admit(peer(0)), Ok(()));

        let events = events.lock().unwrap();
        assert!(events.contains(&MembershipEvent::MemberRemoved {
            peer_id: peer(0),
            graceful: true,
        }));
        assert!(events.contains(&MembershipEvent::AdmissionRejected {
            peer_id: peer(0),
            reason: "protected".to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot() {
        let h = harness(DisconnectConfig::default());
        h.monitor
            .on_peer_disconnected(peer(0), DetectionMethod::IdleTimeout, 0);
        h.monitor.on_peer_left(peer(1));

        let snapshot = h.monitor.snapshot();
        assert_eq!(snapshot.member_count, 5);
        assert_eq!(snapshot.in_grace_period, vec![peer(0)]);
        assert_eq!(snapshot.protected, vec![peer(1)]);
        assert!(snapshot.flapping.is_empty());
        assert!(snapshot.open_sessions.is_empty());
    }
}
