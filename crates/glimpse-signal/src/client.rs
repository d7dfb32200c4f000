//! Remote store client
//!
//! [`RemoteStore`] implements [`KvStore`] by forwarding every operation to a
//! [`crate::StoreServer`] over one WebSocket. Requests are pipelined: each gets
//! a fresh ID and the reader task completes the matching waiter when the
//! response arrives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use glimpse_core::{KvStore, StoreError};

use crate::messages::{StoreOp, StoreRequest, StoreResponse, StoreResult};

/// Default time to wait for a connection or a response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = Arc<DashMap<u64, oneshot::Sender<StoreResult>>>;

/// [`KvStore`] backed by a remote store server
pub struct RemoteStore {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteStore {
    /// Connect with the default timeout
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_timeout(url, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Connect to a store server at a `ws://` or `wss://` URL
    pub async fn connect_with_timeout(
        url: &str,
        request_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let url = Url::parse(url).map_err(|e| StoreError::Connection(e.to_string()))?;

        debug!("Connecting to store server: {}", url);

        let (ws, _response) = match timeout(request_timeout, connect_async(url.as_str())).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(StoreError::Connection(e.to_string())),
            Err(_) => return Err(StoreError::Timeout),
        };

        info!("Connected to store server {}", url);

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let writer = {
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(msg) = outgoing_rx.recv().await {
                    if let Err(e) = ws_sender.send(msg).await {
                        warn!("Store connection write failed: {}", e);
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
                let _ = ws_sender.close().await;
            })
        };

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("Store connection error: {}", e);
                            break;
                        }
                    };

                    match StoreResponse::from_json(&text) {
                        Ok(response) => {
                            if let Some((_, waiter)) = pending.remove(&response.id) {
                                let _ = waiter.send(response.result);
                            } else {
                                debug!("Dropping response for unknown request {}", response.id);
                            }
                        }
                        Err(e) => warn!("Unreadable store response: {}", e),
                    }
                }

                closed.store(true, Ordering::SeqCst);
                // Dropping the senders fails every outstanding request
                pending.clear();
                debug!("Store connection closed");
            })
        };

        Ok(Self {
            url: url.to_string(),
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            closed,
            tasks: vec![writer, reader],
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Round-trip a ping
    pub async fn ping(&self) -> Result<(), StoreError> {
        match self.request(StoreOp::Ping).await? {
            StoreResult::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&self, op: StoreOp) -> Result<StoreResult, StoreError> {
        if !self.is_connected() {
            return Err(StoreError::Connection("connection closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let json = StoreRequest::new(id, op).to_json()?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self.outgoing.send(Message::Text(json)).is_err() {
            self.pending.remove(&id);
            return Err(StoreError::Connection("connection closed".into()));
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result.into_result(),
            Ok(Err(_)) => Err(StoreError::Connection("connection closed".into())),
            Err(_) => {
                self.pending.remove(&id);
                Err(StoreError::Timeout)
            }
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn unexpected(result: StoreResult) -> StoreError {
    StoreError::Serialization(format!("unexpected response: {:?}", result))
}

#[async_trait]
impl KvStore for RemoteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.request(StoreOp::Get { key: key.to_string() }).await? {
            StoreResult::Value { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        match self
            .request(StoreOp::Set {
                key: key.to_string(),
                value,
            })
            .await?
        {
            StoreResult::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.request(StoreOp::Delete { key: key.to_string() }).await? {
            StoreResult::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        match self
            .request(StoreOp::ListKeys {
                prefix: prefix.to_string(),
            })
            .await?
        {
            StoreResult::Keys { keys } => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<String>,
    ) -> Result<bool, StoreError> {
        match self
            .request(StoreOp::CompareAndSet {
                key: key.to_string(),
                expected: expected.map(str::to_string),
                value,
            })
            .await?
        {
            StoreResult::Swapped { swapped } => Ok(swapped),
            other => Err(unexpected(other)),
        }
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url() {
        let err = RemoteStore::connect("not a url").await.err().unwrap();
        assert!(matches!(err, StoreError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result =
            RemoteStore::connect_with_timeout(&format!("ws://127.0.0.1:{}", port), Duration::from_secs(2))
                .await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }
}
