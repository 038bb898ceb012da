//! Witness voting message types.
//!
//! Sent as JSON by whatever gossip layer carries them. Delivery may be
//! at-least-once; a repeated confirmation from the same witness overwrites
//! the earlier one, so duplicates are harmless.

use crate::{PeerId, RealmId, ReportId};
use serde::{Deserialize, Serialize};

/// How a disconnect was detected. Logged only, never weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetectionMethod {
    /// The peer announced it is leaving
    GracefulLeave,
    /// Transport connection went idle
    IdleTimeout,
    /// Liveness probe got no answer
    LivenessTimeout,
    /// Relay reported the circuit to the peer closed
    RelayCircuitClosed,
    /// Operator report
    Manual,
}

/// A witness's opinion about a disconnect report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Vote {
    /// The witness cannot reach the target either
    Agree,
    /// The witness can still reach the target
    Disagree,
}

/// Final outcome of a voting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Verdict {
    Confirmed,
    Rejected,
}

/// Request to corroborate a suspected disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectReport {
    pub report_id: ReportId,
    /// Member that observed the disconnect and runs the session
    pub reporter: PeerId,
    pub target: PeerId,
    pub realm: RealmId,
    pub method: DetectionMethod,
    /// Last contact with the target, milliseconds since Unix epoch
    pub last_contact_ms: u64,
}

/// A witness's vote on a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WitnessConfirmation {
    pub witness_id: PeerId,
    pub report_id: ReportId,
    pub vote: Vote,
}

/// The reporter's final verdict on a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WitnessVotingResult {
    pub report_id: ReportId,
    pub target_peer_id: PeerId,
    pub confirmed: bool,
}

/// Everything exchanged between members for witness voting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WitnessMessage {
    Report(DisconnectReport),
    Confirmation(WitnessConfirmation),
    Result(WitnessVotingResult),
}

impl WitnessMessage {
    pub fn confirmation(witness_id: PeerId, report_id: ReportId, vote: Vote) -> Self {
        Self::Confirmation(WitnessConfirmation {
            witness_id,
            report_id,
            vote,
        })
    }

    pub fn result(report_id: ReportId, target_peer_id: PeerId, confirmed: bool) -> Self {
        Self::Result(WitnessVotingResult {
            report_id,
            target_peer_id,
            confirmed,
        })
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    /// The report this message belongs to.
    pub fn report_id(&self) -> ReportId {
        match self {
            Self::Report(r) => r.report_id,
            Self::Confirmation(c) => c.report_id,
            Self::Result(r) => r.report_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_a() -> PeerId {
        "a1b2c3d4e5f67890".parse().unwrap()
    }

    fn peer_b() -> PeerId {
        "1234567890abcdef".parse().unwrap()
    }

    #[test]
    fn test_confirmation_json_shape() {
        let report_id = ReportId::generate();
        let msg = WitnessMessage::confirmation(peer_a(), report_id, Vote::Agree);

        let json: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "confirmation");
        assert_eq!(json["witnessId"], "a1b2c3d4e5f67890");
        assert_eq!(json["vote"], "agree");
        assert_eq!(json["reportId"], report_id.to_string());
    }

    #[test]
    fn test_report_parses_from_json() {
        let report_id = ReportId::generate();
        let json = format!(
            r#"{{"type":"report","reportId":"{}","reporter":"{}","target":"{}","realm":"home","method":"relayCircuitClosed","lastContactMs":1700000000000}}"#,
            report_id,
            peer_a(),
            peer_b()
        );

        let msg = WitnessMessage::from_json(json.as_bytes()).unwrap();
        match msg {
            WitnessMessage::Report(report) => {
                assert_eq!(report.report_id, report_id);
                assert_eq!(report.target, peer_b());
                assert_eq!(report.method, DetectionMethod::RelayCircuitClosed);
                assert_eq!(report.realm.as_str(), "home");
            }
            other => panic!("Expected report, got {:?}", other),
        }
    }

    #[test]
    fn test_result_report_id() {
        let report_id = ReportId::generate();
        let msg = WitnessMessage::result(report_id, peer_a(), true);
        assert_eq!(msg.report_id(), report_id);
    }

    #[test]
    fn test_invalid_json_returns_none() {
        assert!(WitnessMessage::from_json(b"not json").is_none());
        assert!(WitnessMessage::from_json(br#"{"type":"other"}"#).is_none());
    }
}
