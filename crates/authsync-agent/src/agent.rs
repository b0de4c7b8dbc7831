//! Change-detection agent.
//!
//! One agent per page context. The page store reports mutations and cross-tab
//! changes through its change listener; the embedder reports visibility and
//! focus through [`AgentHandle`]. Every trigger goes through the agent's
//! [`CheckScheduler`]; checks that find an observable change push it through
//! the [`SyncTransport`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use authsync_core::{AuthEvent, AuthFingerprint, CredentialSet, Payload, SyncAction, SyncConfig};
use authsync_store::{ChangeOrigin, ChangeSubscription, ObservableStore, PageKeys, StoreChange};
use authsync_transport::{SyncTransport, TransportError};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::scheduler::{CheckScheduler, CheckSource, DueCheck};
use crate::state::{CheckDecision, SyncAgentState};

/// The agent proper. Created and driven through [`ChangeDetectionAgent::spawn`].
pub struct ChangeDetectionAgent {
    store: Arc<dyn ObservableStore>,
    keys: PageKeys,
    transport: SyncTransport,
    state: Mutex<SyncAgentState>,
    requests: mpsc::UnboundedSender<CheckSource>,
    visible: AtomicBool,
    debounce: Duration,
    settle: Duration,
    poll_interval: Duration,
    poll_freshness: Duration,
    max_follow_ups: u32,
}

impl ChangeDetectionAgent {
    /// Start an agent for one page.
    ///
    /// `resync` receives the central process's broadcasts; a
    /// `ResyncRequested` event triggers a forced check.
    pub fn spawn(
        config: &SyncConfig,
        store: Arc<dyn ObservableStore>,
        transport: SyncTransport,
        resync: Option<broadcast::Receiver<AuthEvent>>,
    ) -> AgentHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let keys = PageKeys::from_config(config);

        let agent = Arc::new(Self {
            store: Arc::clone(&store),
            keys: keys.clone(),
            transport,
            state: Mutex::new(SyncAgentState::new()),
            requests: tx.clone(),
            visible: AtomicBool::new(true),
            debounce: config.debounce(),
            settle: config.settle_delay(),
            poll_interval: config.poll_interval(),
            poll_freshness: config.poll_freshness(),
            max_follow_ups: config.max_follow_ups,
        });

        let listener_tx = tx.clone();
        let subscription = store.on_change(Arc::new(move |change: &StoreChange| {
            if !keys.is_credential_key(&change.key) {
                return;
            }
            let source = match change.origin {
                ChangeOrigin::Local => CheckSource::Mutation,
                ChangeOrigin::CrossTab => CheckSource::StorageEvent,
            };
            let _ = listener_tx.send(source);
        }));

        let _ = tx.send(CheckSource::Initial);
        let task = tokio::spawn(Arc::clone(&agent).run(rx, resync));
        info!("Change-detection agent started");

        AgentHandle {
            agent,
            task,
            _subscription: subscription,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<CheckSource>,
        mut resync: Option<broadcast::Receiver<AuthEvent>>,
    ) {
        let mut scheduler = CheckScheduler::new(self.debounce, self.settle);
        let mut poll =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync_open = resync.is_some();

        loop {
            let deadline = scheduler.next_deadline();
            tokio::select! {
                Some(source) = requests.recv() => {
                    if let Some(due) = scheduler.request(source, Instant::now()) {
                        self.check(due);
                    }
                }
                _ = wait_until(deadline) => {
                    if let Some(due) = scheduler.take_due(Instant::now()) {
                        self.check(due);
                    }
                }
                _ = poll.tick() => {
                    if self.state.lock().is_fresh(Instant::now(), self.poll_freshness) {
                        debug!("Poll skipped: checked recently");
                    } else if let Some(due) = scheduler.request(CheckSource::Poll, Instant::now()) {
                        self.check(due);
                    }
                }
                event = next_event(resync.as_mut()), if resync_open => match event {
                    Some(AuthEvent::ResyncRequested) => {
                        if let Some(due) = scheduler.request(CheckSource::ResyncRequested, Instant::now()) {
                            self.check(due);
                        }
                    }
                    Some(AuthEvent::Changed { .. }) => {}
                    None => {
                        debug!("Resync channel closed");
                        resync_open = false;
                    }
                },
            }
        }
    }

    /// Read the page store and start a sync if the decision calls for one.
    fn check(self: &Arc<Self>, due: DueCheck) {
        let set = self.keys.read(self.store.as_ref());
        let fingerprint = set.fingerprint();
        let decision = self
            .state
            .lock()
            .decide(&fingerprint, due.forced, Instant::now());

        match decision {
            CheckDecision::Unchanged => {
                debug!("Check ({}): no change ({})", due.source, fingerprint);
            }
            CheckDecision::Coalesced => {
                debug!(
                    "Check ({}): change to {} coalesced, sync in progress",
                    due.source, fingerprint
                );
            }
            CheckDecision::Sync => {
                info!(
                    "Check ({}{}): pushing {}",
                    due.source,
                    if due.forced { ", forced" } else { "" },
                    fingerprint
                );
                let agent = Arc::clone(self);
                tokio::spawn(async move { agent.push(set, fingerprint).await });
            }
        }
    }

    async fn push(&self, set: CredentialSet, fingerprint: AuthFingerprint) {
        let (action, payload) = if set.is_empty() {
            (SyncAction::Clear, None)
        } else {
            (SyncAction::Write, Some(Payload::Credentials(set)))
        };

        match self.transport.send(action, payload).await {
            Ok(ack) => {
                debug!("{} acknowledged after {} attempt(s)", action, ack.attempts);
                self.state.lock().sync_succeeded(fingerprint, Instant::now());
            }
            Err(e @ TransportError::Rejected { .. }) => {
                warn!("Sync rejected, not retrying: {}", e);
                self.state.lock().sync_rejected(fingerprint);
            }
            Err(e @ TransportError::Exhausted { .. }) => {
                let failures = self.state.lock().sync_failed();
                if failures <= self.max_follow_ups {
                    warn!("Sync failed ({}); scheduling follow-up", e);
                    let _ = self.requests.send(CheckSource::Retry);
                } else {
                    warn!(
                        "Sync failed {} times in a row ({}); waiting for next trigger",
                        failures, e
                    );
                }
            }
        }
    }

    fn request(&self, source: CheckSource) {
        if self.requests.send(source).is_err() {
            debug!("Agent stopped; dropping {} request", source);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_event(rx: Option<&mut broadcast::Receiver<AuthEvent>>) -> Option<AuthEvent> {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} broadcast events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Control surface for a running agent. Dropping it stops the agent and
/// unregisters its store listener.
pub struct AgentHandle {
    agent: Arc<ChangeDetectionAgent>,
    task: JoinHandle<()>,
    _subscription: ChangeSubscription,
}

impl AgentHandle {
    /// Report a page visibility change. Only hidden→visible triggers a check.
    pub fn notify_visibility(&self, visible: bool) {
        let was_visible = self.agent.visible.swap(visible, Ordering::SeqCst);
        if visible && !was_visible {
            self.agent.request(CheckSource::Visibility);
        }
    }

    /// Report that the window regained focus.
    pub fn notify_focus(&self) {
        self.agent.request(CheckSource::Focus);
    }

    /// Ask for a check from an arbitrary source.
    pub fn request_check(&self, source: CheckSource) {
        self.agent.request(source);
    }

    /// Snapshot of the agent's bookkeeping.
    pub fn state(&self) -> SyncAgentState {
        self.agent.state.lock().clone()
    }

    /// Stop the agent. An in-flight push finishes on its own.
    pub fn shutdown(self) {
        info!("Change-detection agent stopped");
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use authsync_core::{Identity, SyncMessage, SyncResponse};
    use authsync_store::OriginStorage;
    use authsync_transport::{ChannelError, MessageChannel, RetryPolicy};

    /// Records every delivery; replies after `latency`, or fails while `down`.
    struct RecordingChannel {
        latency: Duration,
        down: AtomicBool,
        delivered: Mutex<Vec<SyncMessage>>,
    }

    impl RecordingChannel {
        fn new(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                latency,
                down: AtomicBool::new(false),
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.delivered.lock().len()
        }

        fn last(&self) -> Option<SyncMessage> {
            self.delivered.lock().last().cloned()
        }
    }

    #[async_trait]
    impl MessageChannel for RecordingChannel {
        async fn deliver(&self, message: SyncMessage) -> Result<SyncResponse, ChannelError> {
            self.delivered.lock().push(message);
            tokio::time::sleep(self.latency).await;
            if self.down.load(Ordering::SeqCst) {
                return Err(ChannelError::Unavailable("central process asleep".into()));
            }
            Ok(SyncResponse::ok())
        }
    }

    fn signed_in(user: &str) -> CredentialSet {
        CredentialSet::new(format!("token-{}", user), Identity::new(user))
    }

    fn setup(
        latency: Duration,
    ) -> (
        Arc<RecordingChannel>,
        authsync_store::TabStore,
        SyncTransport,
        SyncConfig,
    ) {
        let channel = RecordingChannel::new(latency);
        let transport = SyncTransport::new(channel.clone(), RetryPolicy::default());
        let tab = OriginStorage::new("https://app.example.com").open_tab();
        (channel, tab, transport, SyncConfig::default())
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_forced_check_pushes_existing_credential() {
        let (channel, tab, transport, config) = setup(Duration::from_millis(10));
        PageKeys::default().write(&tab, &signed_in("u1"));

        let handle = ChangeDetectionAgent::spawn(&config, Arc::new(tab), transport, None);
        settle(100).await;

        assert_eq!(channel.count(), 1);
        let msg = channel.last().unwrap();
        assert_eq!(msg.action, SyncAction::Write);
        assert_eq!(
            handle.state().last_fingerprint,
            Some(signed_in("u1").fingerprint())
        );
        assert!(!handle.state().in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutations_are_debounced() {
        let (channel, tab, transport, config) = setup(Duration::from_millis(10));
        let keys = PageKeys::default();
        let handle =
            ChangeDetectionAgent::spawn(&config, Arc::new(tab.clone()), transport, None);
        settle(100).await;
        assert_eq!(channel.count(), 1); // initial clear

        keys.write(&tab, &signed_in("u1"));
        settle(50).await;
        assert_eq!(channel.count(), 1);
        settle(300).await;
        assert_eq!(channel.count(), 2);
        assert_eq!(channel.last().unwrap().action, SyncAction::Write);
        assert_eq!(
            handle.state().last_fingerprint,
            Some(signed_in("u1").fingerprint())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_sends_clear() {
        let (channel, tab, transport, config) = setup(Duration::from_millis(10));
        let keys = PageKeys::default();
        keys.write(&tab, &signed_in("u1"));
        let _handle =
            ChangeDetectionAgent::spawn(&config, Arc::new(tab.clone()), transport, None);
        settle(100).await;

        keys.clear(&tab);
        settle(400).await;
        assert_eq!(channel.count(), 2);
        let msg = channel.last().unwrap();
        assert_eq!(msg.action, SyncAction::Clear);
        assert!(msg.payload.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_rotation_alone_is_not_pushed() {
        let (channel, tab, transport, config) = setup(Duration::from_millis(10));
        let keys = PageKeys::default();
        keys.write(&tab, &signed_in("u1"));
        let _handle =
            ChangeDetectionAgent::spawn(&config, Arc::new(tab.clone()), transport, None);
        settle(100).await;

        tab.set("auth_token", "rotated");
        settle(400).await;
        assert_eq!(channel.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_during_sync_are_coalesced() {
        let (channel, tab, transport, config) = setup(Duration::from_secs(1));
        let keys = PageKeys::default();
        keys.write(&tab, &signed_in("u1"));
        let handle =
            ChangeDetectionAgent::spawn(&config, Arc::new(tab.clone()), transport, None);
        settle(1_500).await;
        assert_eq!(channel.count(), 1);

        // u2 starts a one-second sync; u3 and u4 land while it is in flight.
        keys.write(&tab, &signed_in("u2"));
        settle(300).await;
        assert_eq!(channel.count(), 2);
        keys.write(&tab, &signed_in("u3"));
        settle(300).await;
        keys.write(&tab, &signed_in("u4"));
        settle(300).await;
        assert_eq!(channel.count(), 2);

        settle(1_000).await;
        let state = handle.state();
        assert!(!state.in_progress);
        assert_eq!(state.last_fingerprint, Some(signed_in("u2").fingerprint()));

        // A later poll picks up the latest page state.
        settle(20_000).await;
        assert_eq!(channel.count(), 3);
        assert_eq!(
            handle.state().last_fingerprint,
            Some(signed_in("u4").fingerprint())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_regain_forces_check() {
        let (channel, tab, transport, config) = setup(Duration::from_millis(10));
        PageKeys::default().write(&tab, &signed_in("u1"));
        let handle = ChangeDetectionAgent::spawn(&config, Arc::new(tab), transport, None);
        settle(100).await;

        handle.notify_visibility(false);
        handle.notify_visibility(true);
        handle.notify_focus();
        settle(100).await;
        assert_eq!(channel.count(), 1);
        settle(400).await;
        assert_eq!(channel.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_skipped_when_recently_checked() {
        let (channel, tab, transport, config) = setup(Duration::from_millis(10));
        PageKeys::default().write(&tab, &signed_in("u1"));
        let start = Instant::now();
        let handle =
            ChangeDetectionAgent::spawn(&config, Arc::new(tab.clone()), transport, None);
        settle(5_000).await;

        // A token-only rotation runs a check without syncing.
        tab.set("auth_token", "rotated");
        settle(5_500).await;
        let checked = handle.state().last_checked_at.unwrap();
        assert!(checked >= start + Duration::from_millis(5_200));
        assert!(checked < start + Duration::from_secs(6));

        // The 20s poll is outside the freshness window and checks again.
        settle(10_000).await;
        let checked = handle.state().last_checked_at.unwrap();
        assert!(checked >= start + Duration::from_secs(20));
        assert_eq!(channel.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_schedules_one_follow_up() {
        let (channel, tab, transport, config) = setup(Duration::from_millis(10));
        channel.down.store(true, Ordering::SeqCst);
        PageKeys::default().write(&tab, &signed_in("u1"));
        let handle = ChangeDetectionAgent::spawn(&config, Arc::new(tab), transport, None);

        // Initial sync: 3 attempts + 1s + 2s backoff. Follow-up: same again.
        settle(8_000).await;
        let state = handle.state();
        assert_eq!(state.failure_count, 2);
        assert_eq!(state.retry_count, 2);
        assert_eq!(channel.count(), 6);
        assert!(!state.in_progress);

        // No third round on its own before the next poll.
        settle(1_000).await;
        assert_eq!(channel.count(), 6);

        channel.down.store(false, Ordering::SeqCst);
        handle.notify_focus();
        settle(500).await;
        let state = handle.state();
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.last_fingerprint, Some(signed_in("u1").fingerprint()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_switch_after_exhaustion_gets_follow_up() {
        let (channel, tab, transport, config) = setup(Duration::from_millis(10));
        channel.down.store(true, Ordering::SeqCst);
        let keys = PageKeys::default();
        keys.write(&tab, &signed_in("u1"));
        let handle =
            ChangeDetectionAgent::spawn(&config, Arc::new(tab.clone()), transport, None);
        settle(8_000).await;
        assert_eq!(channel.count(), 6);
        assert_eq!(handle.state().retry_count, 2);

        // u2: one sync plus one follow-up, both exhausted.
        keys.write(&tab, &signed_in("u2"));
        settle(8_000).await;
        let state = handle.state();
        assert_eq!(channel.count(), 12);
        assert_eq!(state.failure_count, 4);
        assert_eq!(state.retry_count, 2);
        assert_eq!(state.pushing, Some(signed_in("u2").fingerprint()));

        settle(3_000).await;
        assert_eq!(channel.count(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unregisters_store_listener() {
        let (channel, _tab, transport, config) = setup(Duration::from_millis(10));
        let storage = OriginStorage::new("https://app.example.com");
        let tab = storage.open_tab();
        let handle =
            ChangeDetectionAgent::spawn(&config, Arc::new(tab.clone()), transport, None);
        settle(100).await;
        assert_eq!(storage.listener_count(), 1);

        handle.shutdown();
        assert_eq!(storage.listener_count(), 0);

        PageKeys::default().write(&tab, &signed_in("u1"));
        settle(1_000).await;
        assert_eq!(channel.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_request_forces_check() {
        let (channel, tab, transport, config) = setup(Duration::from_millis(10));
        PageKeys::default().write(&tab, &signed_in("u1"));
        let (events, rx) = broadcast::channel(8);
        let _handle = ChangeDetectionAgent::spawn(&config, Arc::new(tab), transport, Some(rx));
        settle(100).await;
        assert_eq!(channel.count(), 1);

        events.send(AuthEvent::ResyncRequested).unwrap();
        settle(100).await;
        assert_eq!(channel.count(), 2);
    }
}
