//! Per-page sync bookkeeping.

use std::time::Duration;

use authsync_core::AuthFingerprint;
use tokio::time::Instant;

/// Outcome of comparing the page store against the last synced state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDecision {
    /// Nothing observable changed and the check was not forced.
    Unchanged,
    /// A change was seen while a sync is in flight; dropped.
    Coalesced,
    /// Start a sync. `in_progress` is now set.
    Sync,
}

/// State of one change-detection agent.
///
/// `in_progress` allows at most one outstanding non-forced sync. Changes
/// observed meanwhile are dropped, not queued: a later forced check or poll
/// picks up whatever the page holds by then.
#[derive(Debug, Clone, Default)]
pub struct SyncAgentState {
    pub last_fingerprint: Option<AuthFingerprint>,
    /// Fingerprint of the most recently started sync.
    pub pushing: Option<AuthFingerprint>,
    pub in_progress: bool,
    /// Consecutive exhausted syncs of `pushing`; reset on success and when a
    /// sync starts for a different fingerprint.
    pub retry_count: u32,
    /// Exhausted syncs over the agent's lifetime.
    pub failure_count: u64,
    /// Transport calls started.
    pub syncs_started: u64,
    /// Last check that completed without error, synced or not.
    pub last_checked_at: Option<Instant>,
}

impl SyncAgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(&mut self, fingerprint: &AuthFingerprint, forced: bool, now: Instant) -> CheckDecision {
        let changed = self.last_fingerprint.as_ref() != Some(fingerprint);
        if !forced && !changed {
            self.last_checked_at = Some(now);
            return CheckDecision::Unchanged;
        }
        if self.in_progress && !forced {
            return CheckDecision::Coalesced;
        }
        if self.pushing.as_ref() != Some(fingerprint) {
            self.retry_count = 0;
            self.pushing = Some(fingerprint.clone());
        }
        self.in_progress = true;
        self.syncs_started += 1;
        CheckDecision::Sync
    }

    pub fn sync_succeeded(&mut self, fingerprint: AuthFingerprint, now: Instant) {
        self.last_fingerprint = Some(fingerprint);
        self.retry_count = 0;
        self.in_progress = false;
        self.last_checked_at = Some(now);
    }

    /// The central process declined the state; resending it unchanged would
    /// be declined again, so it is recorded as handled.
    pub fn sync_rejected(&mut self, fingerprint: AuthFingerprint) {
        self.last_fingerprint = Some(fingerprint);
        self.in_progress = false;
    }

    /// Record an exhausted sync. Returns the consecutive failure count.
    pub fn sync_failed(&mut self) -> u32 {
        self.in_progress = false;
        self.retry_count += 1;
        self.failure_count += 1;
        self.retry_count
    }

    /// Whether a check completed within `freshness` of `now`.
    pub fn is_fresh(&self, now: Instant, freshness: Duration) -> bool {
        self.last_checked_at
            .map_or(false, |at| now.saturating_duration_since(at) < freshness)
    }
}
