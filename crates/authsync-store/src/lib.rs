//! Credential storage for every context.
//!
//! - [`page`]: the page-scoped store the web front end writes to, observable
//!   for local mutations and cross-tab changes.
//! - [`canonical`]: the single authoritative replica owned by the central
//!   process.
//! - [`manager`]: the only component allowed to mutate the canonical replica.

pub mod canonical;
pub mod manager;
pub mod page;
pub mod verifier;

pub use canonical::{
    CanonicalBackend, CanonicalReader, CanonicalRecord, FileCanonicalStore, MemoryCanonicalStore,
};
pub use manager::{CanonicalStatus, CanonicalStoreManager, WriteOutcome};
pub use page::{
    ChangeListener, ChangeOrigin, ChangeSubscription, ObservableStore, OriginStorage, PageKeys,
    StoreChange, TabStore,
};
pub use verifier::{HttpVerifier, RemoteVerifier, Verdict, VerifyError};
