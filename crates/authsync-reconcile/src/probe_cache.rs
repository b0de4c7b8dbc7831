//! Tabs whose probe recently failed.
//!
//! Failed tab URLs are skipped until their entry is older than the TTL.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub struct ProbeFailureCache {
    ttl: Duration,
    failures: Mutex<HashMap<String, Instant>>,
}

impl ProbeFailureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn record_failure(&self, url: &str) {
        self.failures.lock().insert(url.to_string(), Instant::now());
    }

    /// Whether `url` failed within the TTL. Expired entries are dropped.
    pub fn is_suppressed(&self, url: &str) -> bool {
        let mut failures = self.failures.lock();
        match failures.get(url) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                failures.remove(url);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every recorded failure.
    pub fn reset(&self) {
        self.failures.lock().clear();
    }
}
