//! Message channels to the central process.

use std::sync::Arc;

use async_trait::async_trait;
use authsync_core::{SyncAction, SyncMessage, SyncResponse};
use authsync_store::CanonicalStoreManager;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Queue depth of the in-process channel.
const LOCAL_QUEUE: usize = 64;

/// Transport-level failure: the receiver never produced a reply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("channel closed")]
    Closed,
}

/// One request/reply round trip to the central process.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn deliver(&self, message: SyncMessage) -> Result<SyncResponse, ChannelError>;
}

type Envelope = (SyncMessage, oneshot::Sender<SyncResponse>);

/// In-process channel into a manager task.
///
/// The serving task applies store mutations one at a time, like the central
/// process's single event loop. `validate` waits on the remote verifier, so it
/// runs on its own task and never holds up queued writes.
#[derive(Clone)]
pub struct LocalChannel {
    tx: mpsc::Sender<Envelope>,
}

impl LocalChannel {
    /// Spawn the serving task for `manager` and return a connected channel.
    pub fn spawn(manager: Arc<CanonicalStoreManager>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(LOCAL_QUEUE);
        let handle = tokio::spawn(async move {
            info!("Central message loop started");
            while let Some((message, reply)) = rx.recv().await {
                if message.action == SyncAction::Validate {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move {
                        let response = manager.handle(message).await;
                        if reply.send(response).is_err() {
                            debug!("Sender gave up before the verdict was ready");
                        }
                    });
                    continue;
                }
                let response = manager.handle(message).await;
                if reply.send(response).is_err() {
                    debug!("Sender gave up before the reply was ready");
                }
            }
            info!("Central message loop stopped");
        });
        (Self { tx }, handle)
    }
}

#[async_trait]
impl MessageChannel for LocalChannel {
    async fn deliver(&self, message: SyncMessage) -> Result<SyncResponse, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((message, reply_tx))
            .await
            .map_err(|_| ChannelError::Closed)?;
        reply_rx.await.map_err(|_| ChannelError::Closed)
    }
}

/// Channel to the `authsync` daemon over HTTP.
pub struct HttpChannel {
    client: Client,
    url: String,
}

impl HttpChannel {
    /// `base_url` is the daemon root, e.g. `http://127.0.0.1:3017`.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            url: format!("{}/api/auth/message", base_url.trim_end_matches('/')),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MessageChannel for HttpChannel {
    async fn deliver(&self, message: SyncMessage) -> Result<SyncResponse, ChannelError> {
        let response = self
            .client
            .post(&self.url)
            .json(&message)
            .send()
            .await
            .map_err(|e| ChannelError::Unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Unavailable(format!("daemon returned {}", status)));
        }

        response
            .json::<SyncResponse>()
            .await
            .map_err(|e| ChannelError::Unavailable(format!("malformed reply: {}", e)))
    }
}
