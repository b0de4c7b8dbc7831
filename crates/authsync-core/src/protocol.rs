//! Message schema exchanged between contexts.
//!
//! Any serialization works as long as both ends agree; the JSON shape below is
//! what the HTTP daemon accepts:
//!
//! ```text
//! request:  { "id": "...", "action": "write", "payload": { "token": "...", "identity": {...} } }
//! response: { "success": true }
//! ```

use serde::{Deserialize, Serialize};

use crate::types::CredentialSet;

/// Operation requested of the central process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncAction {
    Write,
    Clear,
    Validate,
    RequestBroadcastSync,
    ProbeResult,
}

impl SyncAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Clear => "clear",
            Self::Validate => "validate",
            Self::RequestBroadcastSync => "requestBroadcastSync",
            Self::ProbeResult => "probeResult",
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Message payload: a credential set for `write`/`probeResult`, a raw token for
/// `validate`, nothing otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Token(String),
    Credentials(CredentialSet),
}

/// One request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Correlation id for logs; not used for dedup.
    #[serde(default)]
    pub id: String,
    pub action: SyncAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl SyncMessage {
    pub fn new(id: impl Into<String>, action: SyncAction, payload: Option<Payload>) -> Self {
        Self {
            id: id.into(),
            action,
            payload,
        }
    }

    pub fn credentials(&self) -> Option<&CredentialSet> {
        match &self.payload {
            Some(Payload::Credentials(set)) => Some(set),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match &self.payload {
            Some(Payload::Token(token)) => Some(token),
            _ => None,
        }
    }
}

/// Reply to a [`SyncMessage`].
///
/// `success: false` means the receiver understood the message and declined it;
/// senders must not retry such replies. With `retryable` set the receiver hit
/// a fault of its own (e.g. storage) and the same message may succeed later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
    /// Verdict for `validate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
}

impl SyncResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            retryable: false,
            valid: None,
        }
    }

    pub fn validated(valid: bool) -> Self {
        Self {
            success: true,
            error: None,
            retryable: false,
            valid: Some(valid),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retryable: false,
            valid: None,
        }
    }

    /// The receiver could not apply the message right now.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::rejected(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    #[test]
    fn test_write_message_shape() {
        let msg = SyncMessage::new(
            "m1",
            SyncAction::Write,
            Some(Payload::Credentials(CredentialSet::new(
                "t1",
                Identity::new("u1"),
            ))),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["action"], "write");
        assert_eq!(json["payload"]["token"], "t1");
        assert_eq!(json["payload"]["identity"]["id"], "u1");
    }

    #[test]
    fn test_payload_variants_parse() {
        let msg: SyncMessage = serde_json::from_value(serde_json::json!({
            "action": "validate",
            "payload": "t1",
        }))
        .unwrap();
        assert_eq!(msg.token(), Some("t1"));
        assert!(msg.credentials().is_none());

        let msg: SyncMessage = serde_json::from_value(serde_json::json!({
            "action": "probeResult",
            "payload": { "token": "t2" },
        }))
        .unwrap();
        assert_eq!(msg.credentials().unwrap().token.as_deref(), Some("t2"));

        let msg: SyncMessage =
            serde_json::from_value(serde_json::json!({ "action": "requestBroadcastSync" }))
                .unwrap();
        assert_eq!(msg.action, SyncAction::RequestBroadcastSync);
        assert!(msg.payload.is_none());
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let json = serde_json::to_value(SyncResponse::ok()).unwrap();
        assert_eq!(json, serde_json::json!({ "success": true }));

        let json = serde_json::to_value(SyncResponse::rejected("bad payload")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "bad payload");
        assert!(json.get("retryable").is_none());
    }

    #[test]
    fn test_failed_response_is_retryable() {
        let json = serde_json::to_value(SyncResponse::failed("disk full")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["retryable"], true);

        let parsed: SyncResponse =
            serde_json::from_value(serde_json::json!({ "success": false })).unwrap();
        assert!(!parsed.retryable);
    }
}
