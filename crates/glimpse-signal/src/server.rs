//! WebSocket store server
//!
//! Exposes a [`KvStore`] to remote hosts and viewers so that every endpoint of
//! a session shares one store. Plain HTTP `GET /health` and `GET /stats` are
//! answered on the same port for monitoring.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use glimpse_core::{
    Clock, ErrorCode, GlimpseConfig, KvStore, SystemClock, SIGNALING_PREFIX,
};

use crate::messages::{StoreOp, StoreRequest, StoreResponse, StoreResult};
use crate::registry::SessionRegistry;
use crate::relay::cleanup_queues;

/// Store server state
pub struct StoreServer {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    registry: SessionRegistry,
    config: GlimpseConfig,
    /// Open WebSocket connections
    connections: Arc<AtomicUsize>,
}

impl StoreServer {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, Arc::new(SystemClock), GlimpseConfig::default())
    }

    pub fn with_config(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: GlimpseConfig) -> Self {
        let registry =
            SessionRegistry::with_config(store.clone(), clock.clone(), config.session.clone());
        Self {
            store,
            clock,
            registry,
            config,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Registry view over the served store, used for sweeps and stats
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Get connection count (for monitoring)
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Bind to `addr` and serve until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!(
            "Store server listening on {} ({} backend)",
            listener.local_addr()?,
            self.store.name()
        );

        // Session expiry runs here so it happens even when no host is online
        self.registry.ensure_sweeper();

        let cleanup = tokio::spawn(run_queue_cleanup(
            self.store.clone(),
            self.clock.clone(),
            Duration::from_secs(self.config.signal.queue_cleanup_interval_secs.max(1)),
            self.config.relay.message_expiry_ms,
        ));

        let result = self.accept_loop(listener).await;
        cleanup.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let store = self.store.clone();
            let registry = self.registry.clone();
            let connections = self.connections.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, store, registry, connections).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }
}

/// Periodically strip expired signaling messages
async fn run_queue_cleanup(
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    period: Duration,
    message_expiry_ms: i64,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        cleanup_queues(store.as_ref(), clock.now_ms(), message_expiry_ms).await;
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    store: Arc<dyn KvStore>,
    registry: SessionRegistry,
    connections: Arc<AtomicUsize>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // A WebSocket upgrade is also a GET, so match on the monitoring paths
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await?;
    let head = &peek_buf[..n];
    if head.starts_with(b"GET /health") || head.starts_with(b"GET /stats") {
        let count = connections.load(Ordering::Relaxed);
        return handle_http_request(&mut stream, store.as_ref(), &registry, count).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    connections.fetch_add(1, Ordering::Relaxed);
    debug!("New store connection from {}", peer_addr);

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {:?}", e);
                break;
            }
        };

        let response = match StoreRequest::from_json(&msg) {
            Ok(request) => handle_request(store.as_ref(), request).await,
            Err(e) => StoreResponse::error(0, ErrorCode::InvalidRequest, format!("Invalid JSON: {}", e)),
        };

        let json = match response.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode store response: {}", e);
                continue;
            }
        };

        if ws_sender.send(Message::Text(json)).await.is_err() {
            break;
        }
    }

    connections.fetch_sub(1, Ordering::Relaxed);
    debug!("Store connection closed: {}", peer_addr);
    Ok(())
}

/// Execute one store operation
pub async fn handle_request(store: &dyn KvStore, request: StoreRequest) -> StoreResponse {
    let result = match request.op {
        StoreOp::Get { key } => store.get(&key).await.map(|value| StoreResult::Value { value }),
        StoreOp::Set { key, value } => store.set(&key, value).await.map(|_| StoreResult::Ok),
        StoreOp::Delete { key } => store.delete(&key).await.map(|_| StoreResult::Ok),
        StoreOp::ListKeys { prefix } => store
            .list_keys(&prefix)
            .await
            .map(|keys| StoreResult::Keys { keys }),
        StoreOp::CompareAndSet {
            key,
            expected,
            value,
        } => store
            .compare_and_set(&key, expected.as_deref(), value)
            .await
            .map(|swapped| StoreResult::Swapped { swapped }),
        StoreOp::Ping => Ok(StoreResult::Pong),
    };

    match result {
        Ok(result) => StoreResponse::new(request.id, result),
        Err(e) => {
            warn!("Store operation {} failed: {}", request.id, e);
            StoreResponse::error(request.id, ErrorCode::StorageFailure, e.to_string())
        }
    }
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    store: &dyn KvStore,
    registry: &SessionRegistry,
    connections: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Read the HTTP request
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Parse the request path
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, body) = match path {
        "/health" => (
            "200 OK",
            format!(
                r#"{{"status":"healthy","backend":"{}","connections":{}}}"#,
                store.name(),
                connections
            ),
        ),
        "/stats" => {
            let stats = registry.stats().await;
            let queues = store
                .list_keys(SIGNALING_PREFIX)
                .await
                .map(|keys| keys.len())
                .unwrap_or(0);
            let uptime = stats
                .longest_uptime_minutes(registry.clock().now_ms())
                .map_or_else(|| "null".to_string(), |m| m.to_string());
            (
                "200 OK",
                format!(
                    r#"{{"activeSessions":{},"totalViewers":{},"longestUptimeMinutes":{},"queues":{},"connections":{}}}"#,
                    stats.active_sessions, stats.total_viewers, uptime, queues, connections
                ),
            )
        }
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glimpse_core::MemoryStore;

    #[test]
    fn test_server_creation() {
        let server = StoreServer::new(Arc::new(MemoryStore::new()));
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.store().name(), "memory");
    }

    #[tokio::test]
    async fn test_handle_request_ops() {
        let store = MemoryStore::new();

        let resp = handle_request(
            &store,
            StoreRequest::new(
                1,
                StoreOp::Set {
                    key: "glimpse_session_BA7ZUM4E".into(),
                    value: "{}".into(),
                },
            ),
        )
        .await;
        assert_eq!(resp, StoreResponse::new(1, StoreResult::Ok));

        let resp = handle_request(
            &store,
            StoreRequest::new(
                2,
                StoreOp::Get {
                    key: "glimpse_session_BA7ZUM4E".into(),
                },
            ),
        )
        .await;
        assert_eq!(
            resp.result,
            StoreResult::Value {
                value: Some("{}".into())
            }
        );

        let resp = handle_request(
            &store,
            StoreRequest::new(
                3,
                StoreOp::ListKeys {
                    prefix: "glimpse_".into(),
                },
            ),
        )
        .await;
        assert_eq!(
            resp.result,
            StoreResult::Keys {
                keys: vec!["glimpse_session_BA7ZUM4E".into()]
            }
        );

        let resp = handle_request(
            &store,
            StoreRequest::new(
                4,
                StoreOp::Delete {
                    key: "glimpse_session_BA7ZUM4E".into(),
                },
            ),
        )
        .await;
        assert_eq!(resp.result, StoreResult::Ok);
        assert!(store.is_empty());

        let resp = handle_request(&store, StoreRequest::new(5, StoreOp::Ping)).await;
        assert_eq!(resp, StoreResponse::new(5, StoreResult::Pong));
    }

    #[tokio::test]
    async fn test_handle_compare_and_set() {
        let store = MemoryStore::new();
        let swap = |id, expected: Option<&str>, value: &str| {
            StoreRequest::new(
                id,
                StoreOp::CompareAndSet {
                    key: "glimpse_signaling_BA7ZUM4E_host_1".into(),
                    expected: expected.map(str::to_string),
                    value: Some(value.into()),
                },
            )
        };

        let resp = handle_request(&store, swap(1, None, "[1]")).await;
        assert_eq!(resp.result, StoreResult::Swapped { swapped: true });

        // A writer that read before the first swap loses
        let resp = handle_request(&store, swap(2, None, "[2]")).await;
        assert_eq!(resp.result, StoreResult::Swapped { swapped: false });

        let resp = handle_request(&store, swap(3, Some("[1]"), "[1,2]")).await;
        assert_eq!(resp.result, StoreResult::Swapped { swapped: true });
        assert_eq!(
            store.get("glimpse_signaling_BA7ZUM4E_host_1").await.unwrap(),
            Some("[1,2]".into())
        );
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let server = Arc::new(StoreServer::new(Arc::new(MemoryStore::new())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_listener(listener).await })
        };

        server.registry().create_session("host_1", None).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /stats HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(r#""activeSessions":1"#));
        assert!(response.contains(r#""longestUptimeMinutes":0"#));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.contains(r#""status":"healthy""#));

        handle.abort();
    }
}
