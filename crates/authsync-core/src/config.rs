//! Configuration and data directory management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Paths to all authsync data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Canonical credential record (`data/canonical.json`).
    pub canonical_file: PathBuf,
    /// Persisted sync configuration (`data/authsync.json`).
    pub config_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            canonical_file: root.join("canonical.json"),
            config_file: root.join("authsync.json"),
            root,
        })
    }
}

/// Timing, key, and endpoint settings for every component.
///
/// Durations are persisted as milliseconds; use the accessor methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Daemon HTTP port.
    #[serde(default = "default_port")]
    pub port: u16,

    // Change detection
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Polls are skipped if a check succeeded more recently than this.
    #[serde(default = "default_poll_freshness_ms")]
    pub poll_freshness_ms: u64,
    /// Consecutive failures after which no follow-up attempt is scheduled.
    #[serde(default = "default_max_follow_ups")]
    pub max_follow_ups: u32,
    #[serde(default = "default_token_key")]
    pub token_key: String,
    #[serde(default = "default_identity_key")]
    pub identity_key: String,

    // Transport
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    // Reconciliation
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_broadcast_wait_ms")]
    pub broadcast_wait_ms: u64,
    #[serde(default = "default_probe_failure_ttl_ms")]
    pub probe_failure_ttl_ms: u64,
    /// Origins whose tabs may be probed. `*.example.com` matches subdomains.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    // Verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_url: Option<String>,
    /// Must be shorter than `attempt_timeout_ms`: a validate reply that
    /// arrives after its attempt timed out is discarded.
    #[serde(default = "default_verifier_timeout_ms")]
    pub verifier_timeout_ms: u64,
    /// When set, an unreachable verifier is only trusted for this long after
    /// the last definitive "valid" verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unverified_grace_secs: Option<u64>,

    /// Path to config file (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_port() -> u16 {
    3017
}
fn default_debounce_ms() -> u64 {
    200
}
fn default_settle_delay_ms() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    10_000
}
fn default_poll_freshness_ms() -> u64 {
    9_000
}
fn default_max_follow_ups() -> u32 {
    1
}
fn default_token_key() -> String {
    "auth_token".into()
}
fn default_identity_key() -> String {
    "auth_user".into()
}
fn default_attempt_timeout_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_probe_timeout_ms() -> u64 {
    1_500
}
fn default_broadcast_wait_ms() -> u64 {
    2_000
}
fn default_probe_failure_ttl_ms() -> u64 {
    60_000
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}
fn default_verifier_timeout_ms() -> u64 {
    4_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            debounce_ms: default_debounce_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_freshness_ms: default_poll_freshness_ms(),
            max_follow_ups: default_max_follow_ups(),
            token_key: default_token_key(),
            identity_key: default_identity_key(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            broadcast_wait_ms: default_broadcast_wait_ms(),
            probe_failure_ttl_ms: default_probe_failure_ttl_ms(),
            allowed_origins: default_allowed_origins(),
            verify_url: None,
            verifier_timeout_ms: default_verifier_timeout_ms(),
            unverified_grace_secs: None,
            config_path: PathBuf::new(),
        }
    }
}

impl SyncConfig {
    /// Load config from a JSON file, or return defaults.
    pub fn load(config_path: &Path) -> Self {
        let mut config: SyncConfig = match std::fs::read_to_string(config_path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                warn!(
                    "Ignoring malformed config {}: {}",
                    config_path.display(),
                    e
                );
                SyncConfig::default()
            }),
            Err(_) => SyncConfig::default(),
        };
        config.config_path = config_path.to_path_buf();
        config
    }

    /// Load from the data directory, then apply environment overrides.
    pub fn from_env(paths: &DataPaths) -> Result<Self> {
        let mut config = Self::load(&paths.config_file);

        if let Ok(port) = std::env::var("AUTHSYNC_PORT") {
            config.port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid AUTHSYNC_PORT: {}", port)))?;
        }
        if let Ok(url) = std::env::var("AUTHSYNC_VERIFY_URL") {
            config.verify_url = Some(url);
        }

        config.validate()?;
        info!(
            "Sync config loaded: port={}, debounce={}ms, attempts={}",
            config.port, config.debounce_ms, config.max_attempts
        );
        Ok(config)
    }

    /// Reject settings that would make the protocol unbounded or inert.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(Error::Config("attempt_timeout_ms must be positive".into()));
        }
        if self.verifier_timeout_ms >= self.attempt_timeout_ms {
            return Err(Error::Config(format!(
                "verifier_timeout_ms ({}) must be shorter than attempt_timeout_ms ({})",
                self.verifier_timeout_ms, self.attempt_timeout_ms
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".into()));
        }
        if self.token_key.is_empty() || self.identity_key.is_empty() {
            return Err(Error::Config("page store keys must not be empty".into()));
        }
        Ok(())
    }

    /// Save config to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.config_path, json)?;
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_freshness(&self) -> Duration {
        Duration::from_millis(self.poll_freshness_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn broadcast_wait(&self) -> Duration {
        Duration::from_millis(self.broadcast_wait_ms)
    }

    pub fn probe_failure_ttl(&self) -> Duration {
        Duration::from_millis(self.probe_failure_ttl_ms)
    }

    pub fn verifier_timeout(&self) -> Duration {
        Duration::from_millis(self.verifier_timeout_ms)
    }

    pub fn unverified_grace(&self) -> Option<Duration> {
        self.unverified_grace_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_timings() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(200));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.poll_freshness(), Duration::from_secs(9));
        assert_eq!(config.attempt_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_base_delay(), Duration::from_secs(1));
        assert_eq!(config.probe_timeout(), Duration::from_millis(1500));
        assert_eq!(config.broadcast_wait(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authsync.json");
        let config = SyncConfig::load(&path);
        assert_eq!(config.port, 3017);
        assert_eq!(config.config_path, path);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authsync.json");
        std::fs::write(&path, r#"{"debounce_ms": 50, "allowed_origins": ["https://app.example.com"]}"#)
            .unwrap();

        let config = SyncConfig::load(&path);
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.allowed_origins, vec!["https://app.example.com"]);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path().join("data")).unwrap();
        let mut config = SyncConfig::load(&paths.config_file);
        config.verify_url = Some("https://api.example.com/auth/verify".into());
        config.save().unwrap();

        let reloaded = SyncConfig::load(&paths.config_file);
        assert_eq!(reloaded.verify_url, config.verify_url);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = SyncConfig {
            max_attempts: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_verifier_slower_than_attempt() {
        let config = SyncConfig {
            verifier_timeout_ms: 10_000,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = SyncConfig {
            verifier_timeout_ms: 5_000,
            attempt_timeout_ms: 5_000,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());

        assert!(SyncConfig::default().verifier_timeout() < SyncConfig::default().attempt_timeout());
    }
}
