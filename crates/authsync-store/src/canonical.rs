//! Canonical credential replica and its storage backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use authsync_core::{AuthFingerprint, CredentialSet, Error, Identity, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Current on-disk layout version.
pub const RECORD_VERSION: u32 = 1;

/// Persisted form of the canonical credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

fn default_version() -> u32 {
    RECORD_VERSION
}

impl CanonicalRecord {
    pub fn new(set: &CredentialSet) -> Self {
        Self {
            version: RECORD_VERSION,
            token: set.token.clone(),
            identity: set.identity.clone(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn credentials(&self) -> CredentialSet {
        CredentialSet {
            token: self.token.clone(),
            identity: self.identity.clone(),
        }
    }
}

/// Storage for the single canonical record.
///
/// Only [`crate::CanonicalStoreManager`] holds a backend with write access;
/// everything else reads through a [`CanonicalReader`].
pub trait CanonicalBackend: Send + Sync {
    fn load(&self) -> Result<Option<CanonicalRecord>>;
    fn save(&self, record: &CanonicalRecord) -> Result<()>;
    fn remove(&self) -> Result<()>;
}

/// JSON file backend. Writes go to a temp file first, then rename.
pub struct FileCanonicalStore {
    path: PathBuf,
}

impl FileCanonicalStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl CanonicalBackend for FileCanonicalStore {
    fn load(&self) -> Result<Option<CanonicalRecord>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CanonicalRecord = serde_json::from_str(&data)?;
        if record.version > RECORD_VERSION {
            warn!(
                "Canonical record version {} is newer than supported {}",
                record.version, RECORD_VERSION
            );
        }
        Ok(Some(record))
    }

    fn save(&self, record: &CanonicalRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(record)?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            Error::Storage(format!("failed to replace {}: {}", self.path.display(), e))
        })?;
        debug!("Canonical record saved to {}", self.path.display());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory backend, for tests and embedders without a data directory.
#[derive(Default)]
pub struct MemoryCanonicalStore {
    record: RwLock<Option<CanonicalRecord>>,
}

impl MemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CanonicalBackend for MemoryCanonicalStore {
    fn load(&self) -> Result<Option<CanonicalRecord>> {
        Ok(self.record.read().clone())
    }

    fn save(&self, record: &CanonicalRecord) -> Result<()> {
        *self.record.write() = Some(record.clone());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        *self.record.write() = None;
        Ok(())
    }
}

/// Read-only handle on the canonical replica.
#[derive(Clone)]
pub struct CanonicalReader {
    backend: Arc<dyn CanonicalBackend>,
}

impl CanonicalReader {
    pub(crate) fn new(backend: Arc<dyn CanonicalBackend>) -> Self {
        Self { backend }
    }

    /// Reader over a canonical file owned by another process.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        Self::new(Arc::new(FileCanonicalStore::new(path)))
    }

    /// Current credential, `None` when signed out.
    pub fn read(&self) -> Result<Option<CredentialSet>> {
        Ok(self
            .backend
            .load()?
            .map(|r| r.credentials())
            .filter(|set| !set.is_empty()))
    }

    pub fn fingerprint(&self) -> Result<AuthFingerprint> {
        Ok(self.read()?.unwrap_or_default().fingerprint())
    }
}
