//! Reconciliation bootstrapper: the tiered sequence a surface runs on open.
//!
//! ```text
//! LOCAL_READ -> found  -> VALIDATE -> READY | NOT_AUTHENTICATED
//!                                 -> no verdict -> LOCAL_READ -> READY | NOT_AUTHENTICATED
//!            -> absent -> PROBE_TABS -> found (forwarded) -> READY
//!                                   -> absent -> REQUEST_BROADCAST_SYNC
//!                                             -> wait -> LOCAL_READ -> READY | NOT_AUTHENTICATED
//! ```
//!
//! Every tier is bounded: probes by `probe_timeout`, the broadcast by
//! `broadcast_wait`, messages by the transport's retry policy. Only a set
//! holding a token counts as found, matching [`crate::SurfaceStatus`].

use std::sync::Arc;
use std::time::Duration;

use authsync_core::{AuthEvent, CredentialSet, Payload, SyncAction, SyncConfig};
use authsync_store::CanonicalReader;
use authsync_transport::{SyncTransport, TransportError};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::probe_cache::ProbeFailureCache;
use crate::tabs::{OriginAllowList, TabProber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapPhase {
    LocalRead,
    Validate,
    ProbeTabs,
    RequestBroadcastSync,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapOutcome {
    Ready(CredentialSet),
    NotAuthenticated,
}

/// Result of one bootstrap run, with the phases it went through.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapReport {
    pub outcome: BootstrapOutcome,
    pub phases: Vec<BootstrapPhase>,
}

impl BootstrapReport {
    pub fn is_ready(&self) -> bool {
        matches!(self.outcome, BootstrapOutcome::Ready(_))
    }

    pub fn credentials(&self) -> Option<&CredentialSet> {
        match &self.outcome {
            BootstrapOutcome::Ready(set) => Some(set),
            BootstrapOutcome::NotAuthenticated => None,
        }
    }
}

pub struct ReconciliationBootstrapper {
    reader: CanonicalReader,
    transport: SyncTransport,
    prober: Arc<dyn TabProber>,
    allow: OriginAllowList,
    failures: ProbeFailureCache,
    /// Injection capability and when it was checked; rechecked after the
    /// failure TTL.
    capability: Option<(bool, Instant)>,
    events: Option<broadcast::Receiver<AuthEvent>>,
    probe_timeout: Duration,
    broadcast_wait: Duration,
}

impl ReconciliationBootstrapper {
    pub fn new(
        config: &SyncConfig,
        reader: CanonicalReader,
        transport: SyncTransport,
        prober: Arc<dyn TabProber>,
    ) -> Self {
        Self {
            reader,
            transport,
            prober,
            allow: OriginAllowList::from_config(config),
            failures: ProbeFailureCache::new(config.probe_failure_ttl()),
            capability: None,
            events: None,
            probe_timeout: config.probe_timeout(),
            broadcast_wait: config.broadcast_wait(),
        }
    }

    /// Listen for change broadcasts so the broadcast tier can finish early.
    pub fn with_events(mut self, events: broadcast::Receiver<AuthEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn failures(&self) -> &ProbeFailureCache {
        &self.failures
    }

    /// Drop cached probe failures and the cached capability check.
    pub fn reset(&mut self) {
        self.failures.reset();
        self.capability = None;
    }

    pub async fn run(&mut self) -> BootstrapReport {
        let mut phases = vec![BootstrapPhase::LocalRead];

        if let Some(set) = self.local_read() {
            phases.push(BootstrapPhase::Validate);
            let outcome = match self.validate(set).await {
                Some(outcome) => outcome,
                None => {
                    // The verdict may have landed after its attempt timed out.
                    phases.push(BootstrapPhase::LocalRead);
                    match self.local_read() {
                        Some(current) => BootstrapOutcome::Ready(current),
                        None => BootstrapOutcome::NotAuthenticated,
                    }
                }
            };
            return self.finish(outcome, phases);
        }

        if self.can_probe().await {
            phases.push(BootstrapPhase::ProbeTabs);
            if let Some(set) = self.probe_tabs().await {
                return self.finish(BootstrapOutcome::Ready(set), phases);
            }
        } else {
            debug!("Tab probing unavailable; skipping to broadcast sync");
        }

        phases.push(BootstrapPhase::RequestBroadcastSync);
        self.request_broadcast_sync().await;

        phases.push(BootstrapPhase::LocalRead);
        let outcome = match self.local_read() {
            Some(set) => BootstrapOutcome::Ready(set),
            None => BootstrapOutcome::NotAuthenticated,
        };
        self.finish(outcome, phases)
    }

    fn finish(&self, outcome: BootstrapOutcome, phases: Vec<BootstrapPhase>) -> BootstrapReport {
        match &outcome {
            BootstrapOutcome::Ready(set) => {
                info!("Bootstrap ready: {} ({} phases)", set.fingerprint(), phases.len())
            }
            BootstrapOutcome::NotAuthenticated => {
                info!("Bootstrap finished: not authenticated ({} phases)", phases.len())
            }
        }
        BootstrapReport { outcome, phases }
    }

    /// Signed-in credential from the canonical store, if any.
    fn local_read(&self) -> Option<CredentialSet> {
        match self.reader.read() {
            Ok(set) => set.filter(signed_in),
            Err(e) => {
                warn!("Canonical read failed, treating as absent: {}", e);
                None
            }
        }
    }

    /// `None` when no verdict came back.
    async fn validate(&self, set: CredentialSet) -> Option<BootstrapOutcome> {
        let token = set.token.clone()?;

        match self
            .transport
            .send(SyncAction::Validate, Some(Payload::Token(token)))
            .await
        {
            Ok(ack) if ack.response.valid == Some(false) => {
                info!("Stored token rejected; signed out");
                Some(BootstrapOutcome::NotAuthenticated)
            }
            Ok(_) => Some(BootstrapOutcome::Ready(set)),
            Err(e) => {
                warn!("Validation unavailable, re-reading canonical store: {}", e);
                None
            }
        }
    }

    async fn can_probe(&mut self) -> bool {
        if let Some((available, checked_at)) = self.capability {
            if checked_at.elapsed() < self.failures.ttl() {
                return available;
            }
        }
        let available = self.prober.is_available().await;
        self.capability = Some((available, Instant::now()));
        available
    }

    async fn probe_tabs(&self) -> Option<CredentialSet> {
        let tabs = match tokio::time::timeout(self.probe_timeout, self.prober.list_tabs()).await {
            Ok(Ok(tabs)) => tabs,
            Ok(Err(e)) => {
                warn!("Listing tabs failed: {}", e);
                return None;
            }
            Err(_) => {
                warn!("Listing tabs timed out");
                return None;
            }
        };

        for tab in tabs.iter().filter(|t| self.allow.allows(&t.url)) {
            if self.failures.is_suppressed(&tab.url) {
                debug!("Skipping tab {} ({}): failed recently", tab.id, tab.url);
                continue;
            }

            let set = match tokio::time::timeout(self.probe_timeout, self.prober.probe(tab)).await {
                Ok(Ok(Some(set))) if signed_in(&set) => set,
                Ok(Ok(_)) => {
                    debug!("Tab {} holds no credential", tab.id);
                    continue;
                }
                Ok(Err(e)) => {
                    warn!("Probe of tab {} failed: {}", tab.id, e);
                    self.failures.record_failure(&tab.url);
                    continue;
                }
                Err(_) => {
                    warn!("Probe of tab {} timed out after {:?}", tab.id, self.probe_timeout);
                    self.failures.record_failure(&tab.url);
                    continue;
                }
            };

            info!("Found {} in tab {}; forwarding", set.fingerprint(), tab.id);
            match self
                .transport
                .send(SyncAction::ProbeResult, Some(Payload::Credentials(set.clone())))
                .await
            {
                Ok(_) => return Some(set),
                Err(e) => warn!("Forwarding probe result from tab {} failed: {}", tab.id, e),
            }
        }
        None
    }

    async fn request_broadcast_sync(&mut self) {
        if let Some(rx) = self.events.as_mut() {
            // Only changes caused by this request count.
            loop {
                match rx.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }

        let deadline = Instant::now() + self.broadcast_wait;
        if let Err(e) = self.transport.send(SyncAction::RequestBroadcastSync, None).await {
            match e {
                TransportError::Rejected { .. } => warn!("Broadcast sync declined: {}", e),
                TransportError::Exhausted { .. } => warn!("Broadcast sync not delivered: {}", e),
            }
            return;
        }

        let Some(rx) = self.events.as_mut() else {
            tokio::time::sleep_until(deadline).await;
            return;
        };

        let waited = tokio::time::timeout_at(deadline, async {
            loop {
                match rx.recv().await {
                    Ok(AuthEvent::Changed {
                        credentials: Some(_),
                        ..
                    }) => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;

        match waited {
            Ok(true) => debug!("Credential arrived after broadcast sync"),
            Ok(false) => {
                debug!("Broadcast channel closed");
                tokio::time::sleep_until(deadline).await;
            }
            Err(_) => debug!("No credential within {:?} of broadcast sync", self.broadcast_wait),
        }
    }
}

fn signed_in(set: &CredentialSet) -> bool {
    set.fingerprint().is_signed_in()
}
