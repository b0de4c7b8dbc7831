//! Shared application state.

use std::sync::Arc;

use authsync_core::{DataPaths, SyncConfig};
use authsync_reconcile::OriginAllowList;
use authsync_store::CanonicalStoreManager;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: SyncConfig,
    pub paths: DataPaths,
    pub manager: Arc<CanonicalStoreManager>,
    /// Browser origins allowed to reach the API.
    pub allowed_origins: OriginAllowList,
    pub started_at: String,
}

impl AppState {
    pub fn new(config: SyncConfig, paths: DataPaths, manager: Arc<CanonicalStoreManager>) -> Self {
        Self {
            allowed_origins: OriginAllowList::from_config(&config),
            config,
            paths,
            manager,
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
