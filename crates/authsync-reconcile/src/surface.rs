//! Keeps an open surface's view of the canonical store current.
//!
//! Broadcasts are applied as they arrive; a periodic read of the canonical
//! store catches changes whose broadcast the surface never saw.

use std::time::Duration;

use authsync_core::{AuthEvent, AuthFingerprint};
use authsync_store::CanonicalReader;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapOutcome, BootstrapReport};

/// What the surface should render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurfaceStatus {
    Ready { fingerprint: AuthFingerprint },
    NotAuthenticated,
}

impl SurfaceStatus {
    pub fn from_fingerprint(fingerprint: AuthFingerprint) -> Self {
        if fingerprint.is_signed_in() {
            Self::Ready { fingerprint }
        } else {
            Self::NotAuthenticated
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

impl From<&BootstrapReport> for SurfaceStatus {
    fn from(report: &BootstrapReport) -> Self {
        match &report.outcome {
            BootstrapOutcome::Ready(set) => Self::from_fingerprint(set.fingerprint()),
            BootstrapOutcome::NotAuthenticated => Self::NotAuthenticated,
        }
    }
}

pub struct SurfaceMonitor {
    status: watch::Receiver<SurfaceStatus>,
    task: JoinHandle<()>,
}

impl SurfaceMonitor {
    /// Start monitoring from the status the bootstrap produced.
    pub fn spawn(
        initial: SurfaceStatus,
        reader: CanonicalReader,
        events: Option<broadcast::Receiver<AuthEvent>>,
        poll_interval: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(initial);
        let task = tokio::spawn(monitor_loop(tx, reader, events, poll_interval));
        Self { status: rx, task }
    }

    pub fn status(&self) -> SurfaceStatus {
        self.status.borrow().clone()
    }

    /// Receiver that is notified whenever the status changes.
    pub fn subscribe(&self) -> watch::Receiver<SurfaceStatus> {
        self.status.clone()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn monitor_loop(
    tx: watch::Sender<SurfaceStatus>,
    reader: CanonicalReader,
    mut events: Option<broadcast::Receiver<AuthEvent>>,
    poll_interval: Duration,
) {
    let mut poll = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let next = tokio::select! {
            event = recv_event(events.as_mut()), if events.is_some() => match event {
                Some(AuthEvent::Changed { fingerprint, .. }) => {
                    Some(SurfaceStatus::from_fingerprint(fingerprint))
                }
                Some(AuthEvent::ResyncRequested) => None,
                None => {
                    debug!("Surface broadcast channel closed; polling only");
                    events = None;
                    None
                }
            },
            _ = poll.tick() => match reader.fingerprint() {
                Ok(fingerprint) => Some(SurfaceStatus::from_fingerprint(fingerprint)),
                Err(e) => {
                    warn!("Surface poll could not read the canonical store: {}", e);
                    None
                }
            },
        };

        let Some(next) = next else { continue };
        tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!("Surface status: {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }
}

async fn recv_event(rx: Option<&mut broadcast::Receiver<AuthEvent>>) -> Option<AuthEvent> {
    let rx = rx?;
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Surface missed {} broadcasts", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
