//! One voting session per disconnect report.
//!
//! A session collects votes from witnesses and resolves exactly once, by
//! whichever comes first: a vote that satisfies the decision rule, the
//! timeout, or an explicit cancel. The result is delivered on a oneshot
//! channel; later resolution attempts find the sender already taken.

use super::messages::{Verdict, Vote};
use crate::{PeerId, ReportId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

/// Realms smaller than this confirm on a single agreeing witness.
pub const DEFAULT_FAST_PATH_CUTOFF: usize = 10;

/// Which rule produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Single agreeing witness in a small realm
    FastPath,
    /// Majority once the minimum number of responses arrived
    Quorum,
    /// Majority among whatever votes arrived before the deadline
    Timeout,
    /// Target reconnected (or started flapping) before resolution
    Cancelled,
}

/// Final result of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotingOutcome {
    pub report_id: ReportId,
    pub target: PeerId,
    pub verdict: Verdict,
    pub resolution: Resolution,
    pub agree: usize,
    pub disagree: usize,
}

impl VotingOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.verdict == Verdict::Confirmed
    }
}

/// Votes needed before a standard-path session may resolve.
pub fn min_responses(member_count: usize) -> usize {
    (member_count / 2).max(1)
}

/// Decision rule applied after every vote.
///
/// Returns `None` while the session must keep waiting.
pub fn evaluate(
    member_count: usize,
    fast_path_cutoff: usize,
    agree: usize,
    disagree: usize,
) -> Option<(Verdict, Resolution)> {
    if member_count < fast_path_cutoff {
        return (agree > 0).then_some((Verdict::Confirmed, Resolution::FastPath));
    }

    if agree + disagree < min_responses(member_count) {
        return None;
    }
    Some((majority(agree, disagree), Resolution::Quorum))
}

/// Agree must strictly outnumber disagree; no votes means rejected.
pub fn majority(agree: usize, disagree: usize) -> Verdict {
    if agree > disagree {
        Verdict::Confirmed
    } else {
        Verdict::Rejected
    }
}

struct SessionState {
    votes: HashMap<PeerId, Vote>,
    outcome: Option<VotingOutcome>,
    result_tx: Option<oneshot::Sender<VotingOutcome>>,
    timeout_task: Option<AbortHandle>,
}

impl SessionState {
    fn tally(&self) -> (usize, usize) {
        let agree = self.votes.values().filter(|v| **v == Vote::Agree).count();
        (agree, self.votes.len() - agree)
    }
}

/// Votes on one disconnect report.
pub struct VotingSession {
    report_id: ReportId,
    target: PeerId,
    /// Fixed at open; membership changes during the vote do not move the bar
    member_count_at_open: usize,
    fast_path_cutoff: usize,
    state: Mutex<SessionState>,
    timeout_armed: AtomicBool,
}

impl VotingSession {
    /// Open a session. The receiver yields the outcome exactly once.
    pub fn new(
        report_id: ReportId,
        target: PeerId,
        member_count: usize,
        fast_path_cutoff: usize,
    ) -> (Arc<Self>, oneshot::Receiver<VotingOutcome>) {
        let (result_tx, result_rx) = oneshot::channel();
        let session = Self {
            report_id,
            target,
            member_count_at_open: member_count,
            fast_path_cutoff,
            state: Mutex::new(SessionState {
                votes: HashMap::new(),
                outcome: None,
                result_tx: Some(result_tx),
                timeout_task: None,
            }),
            timeout_armed: AtomicBool::new(false),
        };
        (Arc::new(session), result_rx)
    }

    pub fn report_id(&self) -> ReportId {
        self.report_id
    }

    pub fn target(&self) -> PeerId {
        self.target
    }

    pub fn member_count_at_open(&self) -> usize {
        self.member_count_at_open
    }

    pub fn is_fast_path(&self) -> bool {
        self.member_count_at_open < self.fast_path_cutoff
    }

    /// Arm the deadline. Only the first call has an effect.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn start_timeout(self: &Arc<Self>, duration: Duration) -> bool {
        if self.timeout_armed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let deadline = Instant::now() + duration;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(session) = weak.upgrade() {
                session.resolve_on_timeout();
            }
        });

        let mut state = self.lock();
        if state.outcome.is_some() {
            task.abort();
        } else {
            state.timeout_task = Some(task.abort_handle());
        }
        true
    }

    /// Record a witness's vote. A second vote from the same witness
    /// replaces the first. Ignored once resolved.
    ///
    /// Returns the outcome if this vote resolved the session.
    pub fn add_confirmation(&self, witness_id: PeerId, vote: Vote) -> Option<VotingOutcome> {
        let mut state = self.lock();
        if state.outcome.is_some() {
            debug!("Vote from {} on resolved report {} ignored", witness_id, self.report_id);
            return None;
        }

        state.votes.insert(witness_id, vote);
        let (agree, disagree) = state.tally();
        let (verdict, resolution) =
            evaluate(self.member_count_at_open, self.fast_path_cutoff, agree, disagree)?;
        self.finish(&mut state, verdict, resolution)
    }

    /// Resolve with whatever votes exist. No-op if already resolved.
    pub fn resolve_on_timeout(&self) -> Option<VotingOutcome> {
        let mut state = self.lock();
        let (agree, disagree) = state.tally();
        self.finish(&mut state, majority(agree, disagree), Resolution::Timeout)
    }

    /// Resolve as rejected without further votes. No-op if already resolved.
    pub fn cancel(&self) -> Option<VotingOutcome> {
        let mut state = self.lock();
        self.finish(&mut state, Verdict::Rejected, Resolution::Cancelled)
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().outcome.is_some()
    }

    pub fn outcome(&self) -> Option<VotingOutcome> {
        self.lock().outcome.clone()
    }

    /// (agree, disagree) votes so far.
    pub fn tally(&self) -> (usize, usize) {
        self.lock().tally()
    }

    pub fn vote_count(&self) -> usize {
        self.lock().votes.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(
        &self,
        state: &mut SessionState,
        verdict: Verdict,
        resolution: Resolution,
    ) -> Option<VotingOutcome> {
        if state.outcome.is_some() {
            return None;
        }

        let (agree, disagree) = state.tally();
        let outcome = VotingOutcome {
            report_id: self.report_id,
            target: self.target,
            verdict,
            resolution,
            agree,
            disagree,
        };
        state.outcome = Some(outcome.clone());

        if let Some(task) = state.timeout_task.take() {
            task.abort();
        }
        if let Some(tx) = state.result_tx.take() {
            // Receiver may be gone if nobody waits for the result
            let _ = tx.send(outcome.clone());
        }
        Some(outcome)
    }
}
