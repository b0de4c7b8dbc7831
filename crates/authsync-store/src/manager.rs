//! Canonical store manager, the single authority over the canonical credential.
//!
//! Applies writes and clears idempotently, broadcasts observable changes to
//! listening surfaces, and validates tokens against the remote verifier.

use std::sync::Arc;
use std::time::Duration;

use authsync_core::{
    AuthEvent, AuthFingerprint, CredentialSet, Error, Result, SyncAction, SyncMessage,
    SyncResponse,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::canonical::{CanonicalBackend, CanonicalReader, CanonicalRecord};
use crate::verifier::{RemoteVerifier, Verdict};

/// Capacity of the change broadcast; slow surfaces skip to the latest event.
const EVENT_CAPACITY: usize = 32;

/// Result of a write or clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Fingerprint changed; a change was broadcast.
    Changed,
    /// Only the token string changed; persisted without a broadcast.
    TokenRotated,
    /// Nothing to do.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationOutcome {
    Valid,
    Invalid,
    Unreachable,
}

#[derive(Debug, Clone)]
struct VerificationState {
    token_digest: String,
    first_seen: Instant,
    last_valid_at: Option<Instant>,
    last_outcome: VerificationOutcome,
    checked_at: String,
}

/// Snapshot of the canonical store, safe to expose (no token).
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalStatus {
    #[serde(rename = "signedIn")]
    pub signed_in: bool,
    pub fingerprint: AuthFingerprint,
    #[serde(skip_serializing_if = "Option::is_none", rename = "updatedAt")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "lastVerification")]
    pub last_verification: Option<VerificationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "lastVerifiedAt")]
    pub last_verified_at: Option<String>,
    pub listeners: usize,
}

/// Owner of the canonical credential.
pub struct CanonicalStoreManager {
    backend: Arc<dyn CanonicalBackend>,
    verifier: Option<Arc<dyn RemoteVerifier>>,
    events: broadcast::Sender<AuthEvent>,
    /// Serializes read-compare-write sequences.
    write_lock: Mutex<()>,
    verification: RwLock<Option<VerificationState>>,
    unverified_grace: Option<Duration>,
}

impl CanonicalStoreManager {
    pub fn new(
        backend: Arc<dyn CanonicalBackend>,
        verifier: Option<Arc<dyn RemoteVerifier>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        if verifier.is_none() {
            info!("No remote verifier configured; tokens will not be validated");
        }
        Self {
            backend,
            verifier,
            events,
            write_lock: Mutex::new(()),
            verification: RwLock::new(None),
            unverified_grace: None,
        }
    }

    /// Bound how long an unreachable verifier is trusted for a token.
    pub fn with_unverified_grace(mut self, grace: Option<Duration>) -> Self {
        self.unverified_grace = grace;
        self
    }

    /// Read-only handle for same-process surfaces.
    pub fn reader(&self) -> CanonicalReader {
        CanonicalReader::new(Arc::clone(&self.backend))
    }

    /// Listen for change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    // ---------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------

    /// Persist a credential. An empty set is a clear.
    pub fn write(&self, set: &CredentialSet) -> Result<WriteOutcome> {
        if set.is_empty() {
            return self.clear();
        }

        let _guard = self.write_lock.lock();
        let current = self.load_for_update()?.map(|r| r.credentials());
        if current.as_ref() == Some(set) {
            debug!("Write skipped: canonical credential unchanged");
            return Ok(WriteOutcome::Unchanged);
        }

        self.backend.save(&CanonicalRecord::new(set))?;

        let previous = current.unwrap_or_default().fingerprint();
        let fingerprint = set.fingerprint();
        if previous == fingerprint {
            debug!(
                "Token rotated for {} (digest {})",
                fingerprint,
                set.token_digest().unwrap_or_default()
            );
            return Ok(WriteOutcome::TokenRotated);
        }

        info!("Canonical credential changed: {} -> {}", previous, fingerprint);
        self.broadcast(AuthEvent::Changed {
            fingerprint,
            credentials: Some(set.clone()),
        });
        Ok(WriteOutcome::Changed)
    }

    /// Remove the canonical credential.
    pub fn clear(&self) -> Result<WriteOutcome> {
        let _guard = self.write_lock.lock();
        let outcome = self.clear_locked()?;
        if outcome == WriteOutcome::Changed {
            *self.verification.write() = None;
        }
        Ok(outcome)
    }

    /// Clear without touching the verification record, which may hold the
    /// verdict that caused the clear.
    fn clear_locked(&self) -> Result<WriteOutcome> {
        let current = self.load_for_update()?.map(|r| r.credentials());
        let Some(current) = current.filter(|set| !set.is_empty()) else {
            self.backend.remove()?;
            debug!("Clear skipped: already signed out");
            return Ok(WriteOutcome::Unchanged);
        };

        self.backend.remove()?;
        info!("Canonical credential cleared (was {})", current.fingerprint());
        self.broadcast(AuthEvent::Changed {
            fingerprint: CredentialSet::cleared().fingerprint(),
            credentials: None,
        });
        Ok(WriteOutcome::Changed)
    }

    /// Load the record about to be replaced. An unreadable record is
    /// overwritten rather than blocking every later write.
    fn load_for_update(&self) -> Result<Option<CanonicalRecord>> {
        match self.backend.load() {
            Err(Error::Json(e)) => {
                warn!("Canonical record unreadable, overwriting: {}", e);
                Ok(None)
            }
            other => other,
        }
    }

    /// Clear only if `token` is still the stored one; a newer sign-in wins.
    fn clear_if_current(&self, token: &str) -> Result<WriteOutcome> {
        let _guard = self.write_lock.lock();
        let stored = self.load_for_update()?.and_then(|r| r.token);
        if stored.as_deref() != Some(token) {
            debug!("Rejected token is no longer current; keeping canonical credential");
            return Ok(WriteOutcome::Unchanged);
        }
        self.clear_locked()
    }

    /// Ask every page agent to re-push its state.
    pub fn request_broadcast_sync(&self) -> usize {
        let listeners = self.events.receiver_count();
        info!("Broadcast sync requested ({} listeners)", listeners);
        self.broadcast(AuthEvent::ResyncRequested);
        listeners
    }

    fn broadcast(&self, event: AuthEvent) {
        // No listeners is not an error: surfaces come and go.
        let _ = self.events.send(event);
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    /// Check a token with the remote verifier.
    ///
    /// A definitive rejection clears the canonical store and returns `false`.
    /// An unreachable verifier returns `true`, unless an unverified grace
    /// period is configured and has run out.
    pub async fn validate(&self, token: &str) -> bool {
        let Some(verifier) = self.verifier.clone() else {
            return true;
        };
        let digest = authsync_core::types::token_digest(token);

        match verifier.verify(token).await {
            Ok(Verdict::Valid) => {
                self.record_verification(&digest, VerificationOutcome::Valid);
                debug!("Token {} verified", digest);
                true
            }
            Ok(Verdict::Invalid) => {
                self.record_verification(&digest, VerificationOutcome::Invalid);
                warn!("Token {} rejected by verifier; signing out", digest);
                if let Err(e) = self.clear_if_current(token) {
                    warn!("Failed to clear rejected credential: {}", e);
                }
                false
            }
            Err(e) => {
                self.record_verification(&digest, VerificationOutcome::Unreachable);
                if self.grace_exceeded() {
                    warn!(
                        "Token {} unverified past grace period ({}); signing out",
                        digest, e
                    );
                    if let Err(e) = self.clear_if_current(token) {
                        warn!("Failed to clear unverified credential: {}", e);
                    }
                    false
                } else {
                    info!("Assuming token {} still valid: {}", digest, e);
                    true
                }
            }
        }
    }

    fn record_verification(&self, digest: &str, outcome: VerificationOutcome) {
        let now = Instant::now();
        let mut state = self.verification.write();
        let entry = match state.take() {
            Some(existing) if existing.token_digest == digest => existing,
            _ => VerificationState {
                token_digest: digest.to_string(),
                first_seen: now,
                last_valid_at: None,
                last_outcome: outcome,
                checked_at: String::new(),
            },
        };
        *state = Some(VerificationState {
            last_valid_at: if outcome == VerificationOutcome::Valid {
                Some(now)
            } else {
                entry.last_valid_at
            },
            last_outcome: outcome,
            checked_at: chrono::Utc::now().to_rfc3339(),
            ..entry
        });
    }

    fn grace_exceeded(&self) -> bool {
        let Some(grace) = self.unverified_grace else {
            return false;
        };
        self.verification
            .read()
            .as_ref()
            .map(|s| s.last_valid_at.unwrap_or(s.first_seen).elapsed() > grace)
            .unwrap_or(false)
    }

    // ---------------------------------------------------------------
    // Message dispatch
    // ---------------------------------------------------------------

    /// Apply one message from any context.
    pub async fn handle(&self, message: SyncMessage) -> SyncResponse {
        debug!("Handling {} message {}", message.action, message.id);
        match message.action {
            SyncAction::Write | SyncAction::ProbeResult => {
                let Some(set) = message.credentials() else {
                    return SyncResponse::rejected(format!(
                        "{} requires a credential payload",
                        message.action
                    ));
                };
                if message.action == SyncAction::ProbeResult {
                    info!("Applying credential recovered from a tab probe");
                }
                match self.write(set) {
                    Ok(_) => SyncResponse::ok(),
                    Err(e) => {
                        warn!("Canonical write failed: {}", e);
                        SyncResponse::failed(e.to_string())
                    }
                }
            }
            SyncAction::Clear => match self.clear() {
                Ok(_) => SyncResponse::ok(),
                Err(e) => {
                    warn!("Canonical clear failed: {}", e);
                    SyncResponse::failed(e.to_string())
                }
            },
            SyncAction::Validate => match message.token() {
                Some(token) => SyncResponse::validated(self.validate(token).await),
                None => SyncResponse::rejected("validate requires a token payload"),
            },
            SyncAction::RequestBroadcastSync => {
                self.request_broadcast_sync();
                SyncResponse::ok()
            }
        }
    }

    // ---------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------

    pub fn status(&self) -> Result<CanonicalStatus> {
        let record = self.backend.load()?;
        let fingerprint = record
            .as_ref()
            .map(|r| r.credentials().fingerprint())
            .unwrap_or_else(|| CredentialSet::cleared().fingerprint());
        let verification = self.verification.read().clone();

        Ok(CanonicalStatus {
            signed_in: fingerprint.is_signed_in(),
            fingerprint,
            updated_at: record.map(|r| r.updated_at),
            last_verification: verification.as_ref().map(|v| v.last_outcome),
            last_verified_at: verification.map(|v| v.checked_at),
            listeners: self.events.receiver_count(),
        })
    }
}
