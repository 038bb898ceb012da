//! membership-core: disconnect confirmation and membership stability.
//!
//! Decides when a realm member that stopped answering is really gone:
//! - Grace periods absorb short outages
//! - Flap detection suppresses peers that cycle too fast
//! - Witness voting asks the rest of the realm before removing anyone
//! - Re-admission protection keeps removed peers out for a while
//!
//! `DisconnectMonitor` wires it all together for one realm.

pub mod config;
pub mod disconnect;
pub mod events;
pub mod member;
pub mod monitor;
pub mod peer_id;
pub mod transport;
pub mod witness;

pub use config::DisconnectConfig;
pub use disconnect::{
    DisconnectCoordinator, DisconnectDecision, DisconnectProtectionTracker, DisconnectState,
    GraceExpired, ReconnectOutcome, RejectReason, ReportRateLimiter, StabilityTracker,
};
pub use events::{EventBus, MembershipEvent, Subscription};
pub use member::{MemberError, MemberManager, RealmMembers};
pub use monitor::{DisconnectMonitor, MonitorSnapshot};
pub use peer_id::{PeerId, PeerIdError, RealmId, ReportId};
pub use transport::{ChannelTransport, Outbound, TransportError, WitnessTransport};
pub use witness::{
    DetectionMethod, ReportDecision, Verdict, Vote, VotingOutcome, WitnessMessage, WitnessService,
};
