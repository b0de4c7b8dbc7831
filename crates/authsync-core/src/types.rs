//! Credential model shared by every context.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Signed-in user identity as written by the web front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "displayName"
    )]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Any other fields the front end stores alongside the identity.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            email: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Token plus identity. Either half may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
}

impl CredentialSet {
    pub fn new(token: impl Into<String>, identity: Identity) -> Self {
        Self {
            token: Some(token.into()),
            identity: Some(identity),
        }
    }

    /// The explicit "signed out" marker.
    pub fn cleared() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.identity.is_none()
    }

    pub fn fingerprint(&self) -> AuthFingerprint {
        AuthFingerprint {
            token_present: self.token.is_some(),
            identity_present: self.identity.is_some(),
            identity_id: self.identity.as_ref().map(|i| i.id.clone()),
        }
    }

    /// First 12 hex chars of the token's SHA-256. Safe to log.
    pub fn token_digest(&self) -> Option<String> {
        self.token.as_deref().map(token_digest)
    }
}

/// Short SHA-256 digest of a raw token, for log lines.
pub fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}

/// Minimal comparable projection of a [`CredentialSet`].
///
/// Two sets with equal fingerprints are considered unchanged even when the
/// token string differs, so a plain token rotation does not trigger a resync.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthFingerprint {
    #[serde(rename = "tokenPresent")]
    pub token_present: bool,
    #[serde(rename = "identityPresent")]
    pub identity_present: bool,
    #[serde(rename = "identityId")]
    pub identity_id: Option<String>,
}

impl AuthFingerprint {
    pub fn is_signed_in(&self) -> bool {
        self.token_present
    }
}

impl std::fmt::Display for AuthFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "token={} identity={}",
            self.token_present,
            self.identity_id.as_deref().unwrap_or("-")
        )
    }
}

/// Notification broadcast by the central process to listening surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthEvent {
    /// The canonical credential changed observably.
    #[serde(rename = "authChanged")]
    Changed {
        fingerprint: AuthFingerprint,
        credentials: Option<CredentialSet>,
    },
    /// Page agents should re-push their current state.
    ResyncRequested,
}
