//! End-to-end sync flows across page agents, the central manager, and
//! surfaces, wired in-process and run on tokio's paused clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use authsync_agent::{AgentHandle, ChangeDetectionAgent};
use authsync_core::{
    AuthEvent, CredentialSet, DataPaths, Identity, SyncConfig, SyncMessage, SyncResponse,
};
use authsync_reconcile::{
    BootstrapOutcome, BootstrapPhase, NoTabProber, ReconciliationBootstrapper, SurfaceMonitor,
    SurfaceStatus,
};
use authsync_store::{
    CanonicalStoreManager, FileCanonicalStore, OriginStorage, PageKeys, TabStore,
};
use authsync_transport::{
    ChannelError, LocalChannel, MessageChannel, RetryPolicy, SyncTransport,
};
use tokio::sync::broadcast;

struct Central {
    manager: Arc<CanonicalStoreManager>,
    transport: SyncTransport,
    paths: DataPaths,
    _dir: tempfile::TempDir,
}

fn central() -> Central {
    let dir = tempfile::tempdir().unwrap();
    let paths = DataPaths::new(dir.path()).unwrap();
    let manager = Arc::new(CanonicalStoreManager::new(
        Arc::new(FileCanonicalStore::new(&paths.canonical_file)),
        None,
    ));
    let (channel, _task) = LocalChannel::spawn(Arc::clone(&manager));
    let transport = SyncTransport::new(Arc::new(channel), RetryPolicy::default());
    Central {
        manager,
        transport,
        paths,
        _dir: dir,
    }
}

fn open_page(central: &Central, storage: &Arc<OriginStorage>) -> (TabStore, AgentHandle) {
    let tab = storage.open_tab();
    let agent = ChangeDetectionAgent::spawn(
        &SyncConfig::default(),
        Arc::new(tab.clone()),
        central.transport.clone().with_context("page"),
        Some(central.manager.subscribe()),
    );
    (tab, agent)
}

/// Swallows the next `drop_next` deliveries without a reply, then forwards.
struct FlakyChannel {
    inner: LocalChannel,
    drop_next: AtomicU32,
}

#[async_trait]
impl MessageChannel for FlakyChannel {
    async fn deliver(&self, message: SyncMessage) -> Result<SyncResponse, ChannelError> {
        let dropped = self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return std::future::pending().await;
        }
        self.inner.deliver(message).await
    }
}

fn t1_u1() -> CredentialSet {
    CredentialSet::new("t1", Identity::new("u1"))
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn changes(rx: &mut broadcast::Receiver<AuthEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, AuthEvent::Changed { .. }) {
            count += 1;
        }
    }
    count
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_then_sign_out_reaches_second_surface() {
    let central = central();
    let storage = OriginStorage::new("http://localhost:3000");
    let (tab, _agent) = open_page(&central, &storage);

    let surface = SurfaceMonitor::spawn(
        SurfaceStatus::NotAuthenticated,
        central.manager.reader(),
        Some(central.manager.subscribe()),
        Duration::from_secs(10),
    );
    let mut updates = surface.subscribe();
    advance(100).await;

    let keys = PageKeys::default();
    keys.write(&tab, &t1_u1());
    advance(1_000).await;

    // The broadcast reached the surface and its local read sees the write.
    assert!(updates.has_changed().unwrap());
    assert_eq!(
        surface.status(),
        SurfaceStatus::from_fingerprint(t1_u1().fingerprint())
    );
    assert_eq!(central.manager.reader().read().unwrap(), Some(t1_u1()));
    updates.borrow_and_update();

    keys.clear(&tab);
    advance(1_000).await;
    assert!(updates.has_changed().unwrap());
    assert_eq!(surface.status(), SurfaceStatus::NotAuthenticated);
    assert_eq!(central.manager.reader().read().unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_reaches_polling_surface_within_interval() {
    let central = central();
    let storage = OriginStorage::new("http://localhost:3000");
    let keys = PageKeys::default();
    let (tab, _agent) = open_page(&central, &storage);
    keys.write(&tab, &t1_u1());
    advance(1_000).await;

    // This surface never hears broadcasts.
    let surface = SurfaceMonitor::spawn(
        SurfaceStatus::from_fingerprint(t1_u1().fingerprint()),
        central.manager.reader(),
        None,
        Duration::from_secs(10),
    );

    keys.clear(&tab);
    advance(10_500).await;
    assert_eq!(surface.status(), SurfaceStatus::NotAuthenticated);
}

#[tokio::test(start_paused = true)]
async fn test_tabs_pushing_same_state_broadcast_once() {
    let central = central();
    let mut events = central.manager.subscribe();
    let storage = OriginStorage::new("https://app.example.com");
    let (tab_a, agent_a) = open_page(&central, &storage);
    let (_tab_b, agent_b) = open_page(&central, &storage);
    advance(100).await;

    PageKeys::default().write(&tab_a, &t1_u1());
    advance(1_000).await;

    // Tab A saw the mutation, tab B the cross-tab change; both pushed.
    assert_eq!(agent_a.state().syncs_started, 2);
    assert_eq!(agent_b.state().syncs_started, 2);
    assert_eq!(changes(&mut events), 1);
    assert_eq!(central.manager.reader().read().unwrap(), Some(t1_u1()));
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_recovers_wiped_store_through_resync() {
    let central = central();
    let storage = OriginStorage::new("http://localhost:3000");
    let (tab, _agent) = open_page(&central, &storage);
    PageKeys::default().write(&tab, &t1_u1());
    advance(1_000).await;
    assert!(central.paths.canonical_file.exists());

    std::fs::remove_file(&central.paths.canonical_file).unwrap();

    let mut bootstrapper = ReconciliationBootstrapper::new(
        &SyncConfig::default(),
        central.manager.reader(),
        central.transport.clone().with_context("popup"),
        Arc::new(NoTabProber),
    )
    .with_events(central.manager.subscribe());
    let report = bootstrapper.run().await;

    assert_eq!(report.outcome, BootstrapOutcome::Ready(t1_u1()));
    assert_eq!(
        report.phases,
        vec![
            BootstrapPhase::LocalRead,
            BootstrapPhase::RequestBroadcastSync,
            BootstrapPhase::LocalRead
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_nothing_anywhere_is_not_authenticated() {
    let central = central();
    let storage = OriginStorage::new("http://localhost:3000");
    let (_tab, _agent) = open_page(&central, &storage);
    advance(100).await;

    let mut bootstrapper = ReconciliationBootstrapper::new(
        &SyncConfig::default(),
        central.manager.reader(),
        central.transport.clone(),
        Arc::new(NoTabProber),
    )
    .with_events(central.manager.subscribe());
    let report = bootstrapper.run().await;

    assert_eq!(report.outcome, BootstrapOutcome::NotAuthenticated);
    assert_eq!(
        SurfaceStatus::from(&report),
        SurfaceStatus::NotAuthenticated
    );
}

#[tokio::test(start_paused = true)]
async fn test_flaky_channel_converges_within_retry_bound() {
    let central = central();
    let (local, _task) = LocalChannel::spawn(Arc::clone(&central.manager));
    let flaky = Arc::new(FlakyChannel {
        inner: local,
        drop_next: AtomicU32::new(0),
    });
    let config = SyncConfig::default();
    let policy = RetryPolicy::from_config(&config);
    let storage = OriginStorage::new("http://localhost:3000");
    let tab = storage.open_tab();
    let _agent = ChangeDetectionAgent::spawn(
        &config,
        Arc::new(tab.clone()),
        SyncTransport::new(flaky.clone(), policy),
        None,
    );
    advance(100).await;

    // The first two attempts vanish; the third lands.
    flaky.drop_next.store(2, Ordering::SeqCst);
    let start = tokio::time::Instant::now();
    PageKeys::default().write(&tab, &t1_u1());

    let bound = config.debounce() + policy.worst_case_latency();
    let mut converged_after = None;
    while start.elapsed() <= bound {
        advance(100).await;
        if central.manager.reader().read().unwrap() == Some(t1_u1()) {
            converged_after = Some(start.elapsed());
            break;
        }
    }

    let converged_after = converged_after.expect("canonical store did not converge");
    // debounce + two timeouts + 1s and 2s backoff
    assert!(converged_after >= Duration::from_millis(13_200));
    assert!(converged_after <= bound);
}
