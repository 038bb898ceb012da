//! Witness voting.
//!
//! A member that loses contact with a peer does not remove it on its own
//! word. It opens a voting session and asks the rest of the realm whether
//! they lost the peer too:
//!
//! - Small realms (below `fast_path_cutoff`) confirm on one agreeing witness
//! - Larger realms wait for half the realm to answer, then take the majority
//! - At the deadline the majority of whatever arrived decides; silence rejects

mod messages;
mod service;
mod session;

pub use messages::{
    DetectionMethod, DisconnectReport, Verdict, Vote, WitnessConfirmation, WitnessMessage,
    WitnessVotingResult,
};
pub use service::{ReportDecision, WitnessConfig, WitnessService};
pub use session::{
    DEFAULT_FAST_PATH_CUTOFF, Resolution, VotingOutcome, VotingSession, evaluate, majority,
    min_responses,
};
