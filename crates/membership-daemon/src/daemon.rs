//! Daemon state: one monitor for one realm plus its in-memory member list.

use crate::message::{InputLine, OutputLine};
use membership_core::disconnect::GraceExpired;
use membership_core::{
    ChannelTransport, DisconnectConfig, DisconnectMonitor, EventBus, MemberManager,
    MembershipEvent, Outbound, PeerId, RealmId, RealmMembers, Subscription,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receivers the main loop drains.
pub struct DaemonChannels {
    pub expired: mpsc::UnboundedReceiver<GraceExpired>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub events: mpsc::UnboundedReceiver<MembershipEvent>,
}

pub struct Daemon {
    monitor: Arc<DisconnectMonitor>,
    members: Arc<RealmMembers>,
    _events: Subscription,
}

impl Daemon {
    pub fn new(
        local_id: PeerId,
        realm: RealmId,
        config: &DisconnectConfig,
        initial_members: &[PeerId],
    ) -> (Self, DaemonChannels) {
        let members = Arc::new(RealmMembers::new(local_id));
        for peer_id in initial_members {
            members.add(*peer_id);
        }

        let events = Arc::new(EventBus::new());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let subscription = events.subscribe(move |event| {
            // Receiver gone means we are shutting down
            let _ = event_tx.send(event);
        });

        let (transport, outbound_rx) = ChannelTransport::new();
        let (monitor, expired_rx) = DisconnectMonitor::new(
            local_id,
            realm,
            config,
            members.clone(),
            Arc::new(transport),
            events,
        );

        info!(
            "Monitoring realm {} as {} with {} member(s)",
            monitor.realm(),
            local_id,
            members.total_count()
        );

        (
            Self {
                monitor,
                members,
                _events: subscription,
            },
            DaemonChannels {
                expired: expired_rx,
                outbound: outbound_rx,
                events: event_rx,
            },
        )
    }

    pub fn monitor(&self) -> &Arc<DisconnectMonitor> {
        &self.monitor
    }

    pub fn members(&self) -> &Arc<RealmMembers> {
        &self.members
    }

    /// Handle one raw input line. Bad lines are logged and skipped.
    pub fn handle_line(&self, line: &str) -> Option<OutputLine> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match InputLine::parse(line) {
            Ok(input) => self.handle(input),
            Err(e) => {
                warn!("Skipping input line: {}", e);
                None
            }
        }
    }

    /// Handle one parsed input. Returns a reply for commands.
    pub fn handle(&self, input: InputLine) -> Option<OutputLine> {
        match input {
            InputLine::Disconnected {
                peer_id,
                method,
                last_contact_ms,
            } => {
                let last_contact_ms = last_contact_ms.unwrap_or_else(now_ms);
                self.monitor
                    .on_peer_disconnected(peer_id, method, last_contact_ms);
                None
            }
            InputLine::Reconnected { peer_id } => {
                self.monitor.on_peer_reconnected(peer_id);
                None
            }
            InputLine::Left { peer_id } => {
                self.monitor.on_peer_left(peer_id);
                None
            }
            InputLine::Join { peer_id } => Some(self.join(peer_id)),
            InputLine::Witness { message } => {
                self.monitor.on_witness_message(message);
                None
            }
            InputLine::ClearProtection { peer_id } => {
                self.monitor.coordinator().clear_protection(&peer_id);
                None
            }
            InputLine::Status => Some(OutputLine::Status {
                snapshot: self.monitor.snapshot(),
            }),
        }
    }

    pub fn on_grace_expired(&self, notice: GraceExpired) {
        if let Some(decision) = self.monitor.on_grace_expired(notice) {
            debug!("Grace expiry handled: {:?}", decision);
        }
    }

    pub fn purge_expired(&self) {
        self.monitor.purge_expired();
    }

    fn join(&self, peer_id: PeerId) -> OutputLine {
        match self.monitor.admit(peer_id) {
            Ok(()) => {
                if self.members.add(peer_id) {
                    info!("Admitted {}", peer_id);
                }
                self.monitor.on_peer_reconnected(peer_id);
                OutputLine::Admission {
                    peer_id,
                    accepted: true,
                    reason: None,
                }
            }
            Err(reason) => OutputLine::Admission {
                peer_id,
                accepted: false,
                reason: Some(reason.to_string()),
            },
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
