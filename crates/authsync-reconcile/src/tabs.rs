//! Tab enumeration and one-shot credential probes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use authsync_core::{CredentialSet, SyncConfig};
use authsync_store::{ObservableStore, PageKeys};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// An open tab as reported by the prober.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: u64,
    pub url: String,
}

impl TabInfo {
    pub fn new(id: u64, url: impl Into<String>) -> Self {
        Self { id, url: url.into() }
    }

    /// `scheme://host[:port]` of the tab's URL.
    pub fn origin(&self) -> Option<&str> {
        origin_of(&self.url)
    }
}

fn origin_of(url: &str) -> Option<&str> {
    let scheme_end = url.find("://")?;
    let rest = &url[scheme_end + 3..];
    let authority_len = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    if authority_len == 0 {
        return None;
    }
    Some(&url[..scheme_end + 3 + authority_len])
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("no script-injection capability")]
    NoCapability,
    #[error("tab {0} is gone")]
    TabGone(u64),
    #[error("probe script failed: {0}")]
    Script(String),
}

/// Tab enumeration plus one-shot execution of a store read in a tab.
#[async_trait]
pub trait TabProber: Send + Sync {
    /// Whether probes can be injected at all.
    async fn is_available(&self) -> bool;

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, ProbeError>;

    /// Read the tab's page store. `Ok(None)` means the tab holds no credential.
    async fn probe(&self, tab: &TabInfo) -> Result<Option<CredentialSet>, ProbeError>;
}

/// Origins whose tabs may be probed.
///
/// Entries are exact origins (`http://localhost:3000`) or wildcard hosts
/// (`*.example.com`, optionally with a scheme: `https://*.example.com`). A
/// wildcard also matches the bare domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginAllowList {
    entries: Vec<String>,
}

impl OriginAllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.as_ref().trim().trim_end_matches('/').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(&config.allowed_origins)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn allows(&self, url: &str) -> bool {
        let Some(origin) = origin_of(url) else {
            return false;
        };
        let origin = origin.to_ascii_lowercase();
        let Some((scheme, authority)) = origin.split_once("://") else {
            return false;
        };
        self.entries
            .iter()
            .any(|entry| entry_matches(entry, scheme, authority))
    }
}

fn entry_matches(entry: &str, scheme: &str, authority: &str) -> bool {
    let (entry_scheme, pattern) = match entry.split_once("://") {
        Some((s, p)) => (Some(s), p),
        None => (None, entry),
    };
    if entry_scheme.is_some_and(|s| s != scheme) {
        return false;
    }
    match pattern.strip_prefix("*.") {
        Some(domain) => {
            let host = authority.split(':').next().unwrap_or(authority);
            host == domain || host.ends_with(&format!(".{}", domain))
        }
        None => pattern == authority,
    }
}

/// Prober for surfaces that cannot inject into tabs.
pub struct NoTabProber;

#[async_trait]
impl TabProber for NoTabProber {
    async fn is_available(&self) -> bool {
        false
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, ProbeError> {
        Err(ProbeError::NoCapability)
    }

    async fn probe(&self, _tab: &TabInfo) -> Result<Option<CredentialSet>, ProbeError> {
        Err(ProbeError::NoCapability)
    }
}

/// Prober over page stores living in this process.
pub struct PageTabProber {
    keys: PageKeys,
    tabs: RwLock<Vec<(TabInfo, Arc<dyn ObservableStore>)>>,
    next_id: AtomicU64,
}

impl PageTabProber {
    pub fn new(keys: PageKeys) -> Self {
        Self {
            keys,
            tabs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make a page reachable to probes.
    pub fn register(&self, url: impl Into<String>, store: Arc<dyn ObservableStore>) -> TabInfo {
        let tab = TabInfo::new(self.next_id.fetch_add(1, Ordering::Relaxed), url);
        debug!("Registered tab {} ({})", tab.id, tab.url);
        self.tabs.write().push((tab.clone(), store));
        tab
    }

    pub fn close(&self, id: u64) {
        self.tabs.write().retain(|(tab, _)| tab.id != id);
    }
}

#[async_trait]
impl TabProber for PageTabProber {
    async fn is_available(&self) -> bool {
        true
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, ProbeError> {
        Ok(self.tabs.read().iter().map(|(tab, _)| tab.clone()).collect())
    }

    async fn probe(&self, tab: &TabInfo) -> Result<Option<CredentialSet>, ProbeError> {
        let store = self
            .tabs
            .read()
            .iter()
            .find(|(t, _)| t.id == tab.id)
            .map(|(_, store)| Arc::clone(store))
            .ok_or(ProbeError::TabGone(tab.id))?;
        let set = self.keys.read(store.as_ref());
        Ok(if set.is_empty() { None } else { Some(set) })
    }
}
