//! Configuration surface for the whole subsystem.
//!
//! `DisconnectConfig` is the flat, serializable form (durations in
//! milliseconds) that is loaded from JSON and split into the per-component
//! configs.

use crate::disconnect::{CoordinatorConfig, RateLimitConfig};
use crate::witness::WitnessConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DisconnectConfig {
    /// 0 disables the grace period
    pub grace_period_ms: u64,
    pub flap_window_ms: u64,
    pub flap_threshold: usize,
    pub protection_duration_ms: u64,
    pub fast_path_cutoff: usize,
    pub vote_timeout_ms: u64,
    pub max_reports: u32,
    pub report_window_ms: u64,
}

impl Default for DisconnectConfig {
    fn default() -> Self {
        let coordinator = CoordinatorConfig::default();
        let witness = WitnessConfig::default();
        Self {
            grace_period_ms: millis(coordinator.grace_period),
            flap_window_ms: millis(coordinator.flap_window),
            flap_threshold: coordinator.flap_threshold,
            protection_duration_ms: millis(coordinator.protection_duration),
            fast_path_cutoff: witness.fast_path_cutoff,
            vote_timeout_ms: millis(witness.vote_timeout),
            max_reports: witness.rate_limit.max_reports,
            report_window_ms: millis(witness.rate_limit.window),
        }
    }
}

impl DisconnectConfig {
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            grace_period: Duration::from_millis(self.grace_period_ms),
            flap_window: Duration::from_millis(self.flap_window_ms),
            flap_threshold: self.flap_threshold,
            protection_duration: Duration::from_millis(self.protection_duration_ms),
        }
    }

    pub fn witness(&self) -> WitnessConfig {
        WitnessConfig {
            fast_path_cutoff: self.fast_path_cutoff,
            vote_timeout: Duration::from_millis(self.vote_timeout_ms),
            rate_limit: RateLimitConfig {
                max_reports: self.max_reports,
                window: Duration::from_millis(self.report_window_ms),
            },
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
