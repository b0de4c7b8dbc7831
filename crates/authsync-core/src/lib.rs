//! authsync core: credential model, message schema and configuration.
//!
//! Shared by every execution context: the page agent, the central process
//! that owns the canonical store, and popup surfaces.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::{DataPaths, SyncConfig};
pub use error::{Error, Result};
pub use protocol::{Payload, SyncAction, SyncMessage, SyncResponse};
pub use types::{AuthEvent, AuthFingerprint, CredentialSet, Identity};
