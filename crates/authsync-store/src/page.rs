//! Page-scoped key/value store with change notification.
//!
//! The front end writes its token and identity here. Writers never call into
//! the sync machinery themselves: the store reports every mutation to the
//! listeners registered with [`ObservableStore::on_change`], and every tab of
//! the same origin sees the other tabs' writes as [`ChangeOrigin::CrossTab`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use authsync_core::{CredentialSet, Identity};
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Where a change came from, relative to the observing tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A write or remove issued through this tab's own handle.
    Local,
    /// Another tab of the same origin changed a value.
    CrossTab,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub origin: ChangeOrigin,
}

pub type ChangeListener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

/// Keeps a listener registered. Dropping it unregisters the listener.
#[must_use = "the listener is unregistered when the subscription is dropped"]
pub struct ChangeSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ChangeSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Key/value store observable for mutations.
pub trait ObservableStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    /// Register a listener for local mutations and cross-tab changes, for as
    /// long as the returned subscription lives.
    fn on_change(&self, listener: ChangeListener) -> ChangeSubscription;
}

struct ListenerEntry {
    id: u64,
    tab: u64,
    listener: ChangeListener,
}

/// Storage shared by all tabs of one origin.
pub struct OriginStorage {
    origin: String,
    entries: RwLock<HashMap<String, String>>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_tab: AtomicU64,
    next_listener: AtomicU64,
}

impl OriginStorage {
    pub fn new(origin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            origin: origin.into(),
            entries: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_tab: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Listeners currently registered across all tabs.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Open a handle for a new tab. Listeners registered through the handle
    /// see that tab's own writes as local.
    pub fn open_tab(self: &Arc<Self>) -> TabStore {
        let tab_id = self.next_tab.fetch_add(1, Ordering::Relaxed);
        debug!("Opened tab {} on {}", tab_id, self.origin);
        TabStore {
            tab_id,
            storage: Arc::clone(self),
        }
    }

    fn mutate(&self, writer: u64, key: &str, value: Option<&str>) {
        let changed = {
            let mut entries = self.entries.write();
            let previous = match value {
                Some(v) => entries.insert(key.to_string(), v.to_string()),
                None => entries.remove(key),
            };
            previous.as_deref() != value
        };

        // Listeners run outside the entries lock so they may read the store.
        let listeners: Vec<(u64, ChangeListener)> = self
            .listeners
            .read()
            .iter()
            .map(|e| (e.tab, Arc::clone(&e.listener)))
            .collect();
        for (tab, listener) in listeners {
            if tab == writer {
                listener(&StoreChange {
                    key: key.to_string(),
                    origin: ChangeOrigin::Local,
                });
            } else if changed {
                listener(&StoreChange {
                    key: key.to_string(),
                    origin: ChangeOrigin::CrossTab,
                });
            }
        }
    }
}

/// One tab's view of an [`OriginStorage`].
#[derive(Clone)]
pub struct TabStore {
    tab_id: u64,
    storage: Arc<OriginStorage>,
}

impl TabStore {
    pub fn tab_id(&self) -> u64 {
        self.tab_id
    }

    pub fn origin(&self) -> &str {
        self.storage.origin()
    }
}

impl ObservableStore for TabStore {
    fn get(&self, key: &str) -> Option<String> {
        self.storage.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.storage.mutate(self.tab_id, key, Some(value));
    }

    fn remove(&self, key: &str) {
        self.storage.mutate(self.tab_id, key, None);
    }

    fn on_change(&self, listener: ChangeListener) -> ChangeSubscription {
        let id = self.storage.next_listener.fetch_add(1, Ordering::Relaxed);
        self.storage.listeners.write().push(ListenerEntry {
            id,
            tab: self.tab_id,
            listener,
        });

        let storage: Weak<OriginStorage> = Arc::downgrade(&self.storage);
        ChangeSubscription::new(move || {
            if let Some(storage) = storage.upgrade() {
                storage.listeners.write().retain(|e| e.id != id);
            }
        })
    }
}

/// Keys under which the front end keeps its credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageKeys {
    pub token_key: String,
    pub identity_key: String,
}

impl Default for PageKeys {
    fn default() -> Self {
        Self {
            token_key: "auth_token".into(),
            identity_key: "auth_user".into(),
        }
    }
}

impl PageKeys {
    pub fn from_config(config: &authsync_core::SyncConfig) -> Self {
        Self {
            token_key: config.token_key.clone(),
            identity_key: config.identity_key.clone(),
        }
    }

    pub fn is_credential_key(&self, key: &str) -> bool {
        key == self.token_key || key == self.identity_key
    }

    /// Read the credential from a page store. Empty tokens and identities
    /// that fail to parse count as absent.
    pub fn read(&self, store: &dyn ObservableStore) -> CredentialSet {
        let token = store.get(&self.token_key).filter(|t| !t.is_empty());
        let identity = store
            .get(&self.identity_key)
            .and_then(|raw| match serde_json::from_str::<Identity>(&raw) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!("Ignoring unparseable identity in page store: {}", e);
                    None
                }
            });
        CredentialSet { token, identity }
    }

    /// Write a credential the way the front end does on sign-in.
    pub fn write(&self, store: &dyn ObservableStore, set: &CredentialSet) {
        match &set.token {
            Some(token) => store.set(&self.token_key, token),
            None => store.remove(&self.token_key),
        }
        match &set.identity {
            Some(identity) => match serde_json::to_string(identity) {
                Ok(json) => store.set(&self.identity_key, &json),
                Err(e) => warn!("Failed to serialize identity: {}", e),
            },
            None => store.remove(&self.identity_key),
        }
    }

    /// Remove both fields, as on sign-out.
    pub fn clear(&self, store: &dyn ObservableStore) {
        store.remove(&self.token_key);
        store.remove(&self.identity_key);
    }
}
