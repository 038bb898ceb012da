//! Rate limiting for disconnect reports.
//!
//! One flaky observer must not be able to flood the realm with reports about
//! the same target. Each target gets a counter that resets when its window
//! elapses; attempts are counted whether or not they are allowed.

use crate::PeerId;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for report rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum reports per window for a single target.
    /// Set to 0 to deny every report.
    pub max_reports: u32,
    /// Window duration
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_reports: 3,
            window: Duration::from_secs(60),
        }
    }
}

/// Counter for one target.
#[derive(Debug, Clone, Copy)]
struct ReportWindow {
    started_at: Instant,
    count: u32,
}

/// Per-target disconnect report limiter.
pub struct ReportRateLimiter {
    config: RateLimitConfig,
    windows: DashMap<PeerId, ReportWindow>,
}

impl ReportRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check whether another report about `target` may be raised.
    pub fn allow_report(&self, target: PeerId) -> bool {
        self.allow_report_at(target, Instant::now())
    }

    pub fn allow_report_at(&self, target: PeerId, now: Instant) -> bool {
        let mut window = self.windows.entry(target).or_insert(ReportWindow {
            started_at: now,
            count: 0,
        });

        if now.saturating_duration_since(window.started_at) >= self.config.window {
            window.started_at = now;
            window.count = 0;
        }

        window.count = window.count.saturating_add(1);
        window.count <= self.config.max_reports
    }

    /// Time until `target` may be reported again, if currently limited.
    pub fn retry_after(&self, target: &PeerId) -> Option<Duration> {
        let now = Instant::now();
        self.windows.get(target).and_then(|w| {
            let elapsed = now.saturating_duration_since(w.started_at);
            if w.count >= self.config.max_reports && elapsed < self.config.window {
                Some(self.config.window - elapsed)
            } else {
                None
            }
        })
    }

    /// Drop windows that have elapsed.
    pub fn purge_expired(&self) {
        self.purge_expired_at(Instant::now());
    }

    pub fn purge_expired_at(&self, now: Instant) {
        let window = self.config.window;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started_at) < window);
    }

    /// Number of tracked targets.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for ReportRateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}
