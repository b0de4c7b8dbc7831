//! One coalescing scheduler for every check trigger.
//!
//! Sources are named; each maps to a [`TriggerPolicy`]. Debounced sources
//! share one trailing window, settled sources share one forced slot, and a
//! forced check due at the same time as a debounced one absorbs it.

use std::time::Duration;

use tokio::time::Instant;

/// What asked for a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckSource {
    /// Agent start.
    Initial,
    /// Write or remove through this tab's store handle.
    Mutation,
    /// Another tab changed the store.
    StorageEvent,
    /// Page became visible again.
    Visibility,
    /// Window regained focus.
    Focus,
    /// Periodic poll.
    Poll,
    /// The central process asked all pages to re-push.
    ResyncRequested,
    /// Follow-up after the transport gave up.
    Retry,
}

/// How a source is turned into a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// Run now.
    Immediate { forced: bool },
    /// Run once the source has been quiet for the debounce window.
    Debounced { forced: bool },
    /// Forced check after the settle delay.
    Settled,
}

impl CheckSource {
    pub fn policy(&self) -> TriggerPolicy {
        match self {
            Self::Initial | Self::ResyncRequested => TriggerPolicy::Immediate { forced: true },
            Self::Poll => TriggerPolicy::Immediate { forced: false },
            Self::Mutation | Self::StorageEvent => TriggerPolicy::Debounced { forced: false },
            Self::Retry => TriggerPolicy::Debounced { forced: true },
            Self::Visibility | Self::Focus => TriggerPolicy::Settled,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Mutation => "mutation",
            Self::StorageEvent => "storage-event",
            Self::Visibility => "visibility",
            Self::Focus => "focus",
            Self::Poll => "poll",
            Self::ResyncRequested => "resync",
            Self::Retry => "retry",
        }
    }
}

impl std::fmt::Display for CheckSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A check ready to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueCheck {
    pub forced: bool,
    pub source: CheckSource,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    deadline: Instant,
    forced: bool,
    source: CheckSource,
}

/// Timer state for debounced and settled checks.
#[derive(Debug)]
pub struct CheckScheduler {
    debounce: Duration,
    settle: Duration,
    debounced: Option<Pending>,
    settled: Option<Pending>,
}

impl CheckScheduler {
    pub fn new(debounce: Duration, settle: Duration) -> Self {
        Self {
            debounce,
            settle,
            debounced: None,
            settled: None,
        }
    }

    /// Accept a request. Immediate sources are returned for the caller to
    /// run right away; the rest wait for [`Self::take_due`].
    pub fn request(&mut self, source: CheckSource, now: Instant) -> Option<DueCheck> {
        match source.policy() {
            TriggerPolicy::Immediate { forced } => Some(DueCheck { forced, source }),
            TriggerPolicy::Debounced { forced } => {
                let forced = forced || self.debounced.map_or(false, |p| p.forced);
                self.debounced = Some(Pending {
                    deadline: now + self.debounce,
                    forced,
                    source,
                });
                None
            }
            TriggerPolicy::Settled => {
                // Visibility and focus usually arrive together; keep the
                // first deadline so the pair yields one check.
                if self.settled.is_none() {
                    self.settled = Some(Pending {
                        deadline: now + self.settle,
                        forced: true,
                        source,
                    });
                }
                None
            }
        }
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.debounced, self.settled) {
            (Some(a), Some(b)) => Some(a.deadline.min(b.deadline)),
            (Some(p), None) | (None, Some(p)) => Some(p.deadline),
            (None, None) => None,
        }
    }

    /// Remove and return the checks due at `now`, at most one.
    pub fn take_due(&mut self, now: Instant) -> Option<DueCheck> {
        let settled = self.settled.filter(|p| p.deadline <= now);
        let debounced = self.debounced.filter(|p| p.deadline <= now);
        if settled.is_some() {
            self.settled = None;
        }
        if debounced.is_some() {
            self.debounced = None;
        }

        match (settled, debounced) {
            (Some(s), _) => Some(DueCheck {
                forced: true,
                source: s.source,
            }),
            (None, Some(d)) => Some(DueCheck {
                forced: d.forced,
                source: d.source,
            }),
            (None, None) => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.debounced.is_none() && self.settled.is_none()
    }
}
