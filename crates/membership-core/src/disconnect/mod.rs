//! Local disconnect handling.
//!
//! Everything here runs on one member without talking to anyone else:
//! grace periods, flap detection, re-admission protection and report rate
//! limiting. The coordinator is the entry point; the trackers are exposed
//! for diagnostics and direct use.

mod coordinator;
mod protection;
mod rate_limit;
mod stability;

pub use coordinator::{
    CoordinatorConfig, DisconnectCoordinator, DisconnectDecision, DisconnectState, GraceExpired,
    ReconnectOutcome, RejectReason,
};
pub use protection::{DEFAULT_PROTECTION_DURATION, DisconnectProtectionTracker};
pub use rate_limit::{RateLimitConfig, ReportRateLimiter};
pub use stability::{StabilityConfig, StabilityTracker};
