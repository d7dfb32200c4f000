//! Store-and-poll signaling relay
//!
//! Each endpoint of a session runs one relay. Sending appends a message to the
//! queue of its target (or the `broadcast` queue) in the shared store. A poll
//! loop reads the broadcast queue and the endpoint's own queue every second
//! and hands fresh messages to the handlers registered for their type.
//!
//! # Delivery
//!
//! There is no acknowledgment. A message stays in its queue until it is older
//! than the expiry window, so it is re-delivered on every poll until then
//! (at-least-once). Handlers must be idempotent.
//!
//! Within one poll, broadcast messages are dispatched before direct ones, each
//! in queue order. Nothing is guaranteed across polls.
//!
//! Appends and cleanup rewrites go through [`KvStore::compare_and_set`], so
//! concurrent senders to the same queue never overwrite each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use glimpse_core::{
    queue_key, Clock, KvStore, MessageType, RelayConfig, SignalingMessage, StoreError,
    SystemClock, BROADCAST_TARGET, SIGNALING_PREFIX,
};

/// Attempts at committing one queue write before giving up
const MAX_WRITE_ATTEMPTS: usize = 64;

/// Callback invoked for each delivered message of a registered type
pub type MessageHandler = Arc<dyn Fn(&SignalingMessage) + Send + Sync>;

/// Signaling endpoint bound to one session and one peer ID
///
/// Cheap to clone; clones share handlers and the poll task.
#[derive(Clone)]
pub struct SignalingRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    session_id: String,
    peer_id: String,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
    /// Subscribers per message type, in registration order
    handlers: RwLock<HashMap<MessageType, Vec<MessageHandler>>>,
    destroyed: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
    }
}

impl SignalingRelay {
    /// Create a relay with the system clock and default timings (not yet polling)
    pub fn new(
        session_id: impl Into<String>,
        peer_id: impl Into<String>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self::with_config(
            session_id,
            peer_id,
            store,
            Arc::new(SystemClock),
            RelayConfig::default(),
        )
    }

    /// Create a relay with a custom clock and timings (not yet polling)
    pub fn with_config(
        session_id: impl Into<String>,
        peer_id: impl Into<String>,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                session_id: session_id.into(),
                peer_id: peer_id.into(),
                store,
                clock,
                config,
                handlers: RwLock::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Add a handler for a message type; handlers run in registration order
    pub fn register_handler<F>(&self, kind: MessageType, handler: F)
    where
        F: Fn(&SignalingMessage) + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            return;
        }
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Replace every handler for a message type with `handler`
    pub fn set_handler<F>(&self, kind: MessageType, handler: F)
    where
        F: Fn(&SignalingMessage) + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            return;
        }
        self.inner
            .handlers
            .write()
            .insert(kind, vec![Arc::new(handler) as MessageHandler]);
    }

    /// Number of handlers registered for a message type
    pub fn handler_count(&self, kind: MessageType) -> usize {
        self.inner.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Append a message to the queue of `target` (or the broadcast queue)
    ///
    /// Expired entries of that queue are pruned in the same write. Storage
    /// failures are logged and reported as `false`.
    pub async fn send(&self, kind: MessageType, data: Option<Value>, target: Option<&str>) -> bool {
        if self.is_destroyed() {
            debug!("Relay destroyed, dropping {} message", kind);
            return false;
        }

        let now = self.inner.clock.now_ms();
        let message = SignalingMessage {
            kind,
            session_id: self.inner.session_id.clone(),
            sender_id: self.inner.peer_id.clone(),
            data,
            timestamp: now,
        };

        let target = target.unwrap_or(BROADCAST_TARGET);
        let key = queue_key(&self.inner.session_id, target);

        let result = self.append(&key, &message, now).await;

        match result {
            Ok(()) => {
                debug!(session = %self.inner.session_id, to = %target, "Sent {} message", kind);
                true
            }
            Err(e) => {
                error!("Failed to send {} message to {}: {}", kind, target, e);
                false
            }
        }
    }

    async fn append(&self, key: &str, message: &SignalingMessage, now: i64) -> Result<(), StoreError> {
        let entry = serde_json::to_value(message)?;
        let store = self.inner.store.as_ref();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let (raw, mut queue) = read_queue_raw(store, key).await?;
            queue.push(entry.clone());
            queue.retain(|entry| self.is_fresh(entry, now));
            let json = serde_json::to_string(&queue)?;

            if store.compare_and_set(key, raw.as_deref(), Some(json)).await? {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }

        Err(StoreError::Conflict(key.to_string()))
    }

    /// Start the poll loop; calling it again while running is a no-op
    pub fn start(&self) {
        if self.is_destroyed() {
            return;
        }

        let mut poller = self.inner.poller.lock();
        if poller.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, relay not polling");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.poll_interval();
        *poller = Some(runtime.spawn(run_poller(weak, period)));

        info!(
            session = %self.inner.session_id,
            peer = %self.inner.peer_id,
            "Relay polling every {:?}",
            period
        );
    }

    /// Run one poll cycle: dispatch fresh messages, then sweep expired queues
    ///
    /// Returns the number of messages dispatched to at least one handler.
    pub async fn poll_once(&self) -> usize {
        if self.is_destroyed() {
            return 0;
        }

        let now = self.inner.clock.now_ms();
        let broadcast = self.read_messages(BROADCAST_TARGET).await;
        let direct = self.read_messages(&self.inner.peer_id).await;

        let mut dispatched = 0;
        for message in broadcast.iter().chain(direct.iter()) {
            if !self.accepts(message, now) {
                continue;
            }

            let handlers = match self.inner.handlers.read().get(&message.kind) {
                Some(handlers) if !handlers.is_empty() => handlers.clone(),
                _ => continue,
            };

            for handler in handlers {
                // destroy() may run from inside a handler
                if self.is_destroyed() {
                    return dispatched;
                }
                handler(message);
            }
            dispatched += 1;
        }

        self.cleanup().await;
        dispatched
    }

    /// Strip expired entries from every signaling queue and delete empty queues
    ///
    /// Returns the number of queues deleted.
    pub async fn cleanup(&self) -> usize {
        cleanup_queues(
            self.inner.store.as_ref(),
            self.inner.clock.now_ms(),
            self.inner.config.message_expiry_ms,
        )
        .await
    }

    /// Stop polling and drop all handlers; safe to call more than once
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.inner.poller.lock().take() {
            handle.abort();
        }
        self.inner.handlers.write().clear();

        info!(
            session = %self.inner.session_id,
            peer = %self.inner.peer_id,
            "Relay destroyed"
        );
    }

    /// Whether a message should be handed to this endpoint
    fn accepts(&self, message: &SignalingMessage, now: i64) -> bool {
        message.sender_id != self.inner.peer_id
            && message.session_id == self.inner.session_id
            && message.age_ms(now) < self.inner.config.message_expiry_ms
    }

    fn is_fresh(&self, entry: &Value, now: i64) -> bool {
        entry_is_fresh(entry, now, self.inner.config.message_expiry_ms)
    }

    async fn read_messages(&self, target: &str) -> Vec<SignalingMessage> {
        let key = queue_key(&self.inner.session_id, target);
        match self.read_queue(&key).await {
            Ok(entries) => entries
                .into_iter()
                .filter_map(|entry| serde_json::from_value(entry).ok())
                .collect(),
            Err(e) => {
                error!("Error reading queue {}: {}", key, e);
                Vec::new()
            }
        }
    }

    async fn read_queue(&self, key: &str) -> Result<Vec<Value>, StoreError> {
        read_queue(self.inner.store.as_ref(), key).await
    }
}

/// Poll loop; exits once the relay is destroyed or dropped
async fn run_poller(relay: Weak<RelayInner>, period: std::time::Duration) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tick.tick().await;

        let Some(inner) = relay.upgrade() else {
            break;
        };
        let relay = SignalingRelay { inner };
        if relay.is_destroyed() {
            break;
        }
        relay.poll_once().await;
    }
}

/// Read a queue as raw JSON entries; a missing queue is empty
async fn read_queue(store: &dyn KvStore, key: &str) -> Result<Vec<Value>, StoreError> {
    read_queue_raw(store, key).await.map(|(_, entries)| entries)
}

/// Like [`read_queue`], also returning the stored text for a conditional write
async fn read_queue_raw(
    store: &dyn KvStore,
    key: &str,
) -> Result<(Option<String>, Vec<Value>), StoreError> {
    let Some(json) = store.get(key).await? else {
        return Ok((None, Vec::new()));
    };

    let entries = match serde_json::from_str::<Vec<Value>>(&json) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Discarding unreadable queue {}: {}", key, e);
            Vec::new()
        }
    };
    Ok((Some(json), entries))
}

/// An entry is fresh if it carries a timestamp younger than `expiry_ms`
fn entry_is_fresh(entry: &Value, now: i64, expiry_ms: i64) -> bool {
    entry
        .get("timestamp")
        .and_then(Value::as_i64)
        .map_or(false, |ts| now - ts < expiry_ms)
}

/// Sweep every queue under the signaling prefix
///
/// Shared by relays and the store server. A queue that changes while it is
/// being swept is left for the next sweep. Returns the number of queues deleted.
pub async fn cleanup_queues(store: &dyn KvStore, now: i64, expiry_ms: i64) -> usize {
    let keys = match store.list_keys(SIGNALING_PREFIX).await {
        Ok(keys) => keys,
        Err(e) => {
            error!("Error listing signaling queues: {}", e);
            return 0;
        }
    };

    let mut deleted = 0;
    for key in keys {
        let (raw, entries) = match read_queue_raw(store, &key).await {
            Ok(read) => read,
            Err(e) => {
                error!("Error reading queue {}: {}", key, e);
                continue;
            }
        };

        let total = entries.len();
        let fresh: Vec<Value> = entries
            .into_iter()
            .filter(|entry| entry_is_fresh(entry, now, expiry_ms))
            .collect();

        if raw.is_none() || (!fresh.is_empty() && fresh.len() == total) {
            continue;
        }

        let replacement = if fresh.is_empty() {
            None
        } else {
            match serde_json::to_string(&fresh) {
                Ok(json) => Some(json),
                Err(e) => {
                    error!("Error cleaning queue {}: {}", key, e);
                    continue;
                }
            }
        };
        let emptied = replacement.is_none();

        match store.compare_and_set(&key, raw.as_deref(), replacement).await {
            Ok(true) if emptied => deleted += 1,
            Ok(true) => {}
            Ok(false) => debug!("Queue {} changed during cleanup, skipped", key),
            Err(e) => error!("Error cleaning queue {}: {}", key, e),
        }
    }

    if deleted > 0 {
        debug!("Removed {} expired signaling queues", deleted);
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use glimpse_core::{ManualClock, MemoryStore, MESSAGE_EXPIRY_MS};
    use serde_json::json;

    const T0: i64 = 1_700_000_000_000;
    const SESSION: &str = "BA7ZUM4E";

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(ManualClock::new(T0)),
            }
        }

        fn relay(&self, peer_id: &str) -> SignalingRelay {
            self.relay_in(SESSION, peer_id)
        }

        fn relay_in(&self, session_id: &str, peer_id: &str) -> SignalingRelay {
            SignalingRelay::with_config(
                session_id,
                peer_id,
                self.store.clone(),
                self.clock.clone(),
                RelayConfig::default(),
            )
        }

        async fn queue(&self, target: &str) -> Vec<SignalingMessage> {
            match self.store.get(&queue_key(SESSION, target)).await.unwrap() {
                Some(json) => serde_json::from_str(&json).unwrap(),
                None => Vec::new(),
            }
        }
    }

    /// Store that yields after every read, so concurrent writers interleave
    struct InterleavingStore(MemoryStore);

    #[async_trait]
    impl KvStore for InterleavingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            let value = self.0.get(key).await;
            tokio::task::yield_now().await;
            value
        }
        async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.0.set(key, value).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.0.list_keys(prefix).await
        }
        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<&str>,
            value: Option<String>,
        ) -> Result<bool, StoreError> {
            self.0.compare_and_set(key, expected, value).await
        }
        fn name(&self) -> &'static str {
            "interleaving"
        }
    }

    /// Collects every message handed to it
    fn collector(relay: &SignalingRelay, kind: MessageType) -> Arc<Mutex<Vec<SignalingMessage>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        relay.register_handler(kind, move |msg| sink.lock().push(msg.clone()));
        seen
    }

    #[tokio::test]
    async fn test_send_appends_to_target_queue() {
        let fx = Fixture::new();
        let host = fx.relay("host");

        assert!(host.send(MessageType::Offer, Some(json!({"sdp": "x"})), Some("viewer_1")).await);
        assert!(host.send(MessageType::Leave, None, None).await);

        let direct = fx.queue("viewer_1").await;
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].kind, MessageType::Offer);
        assert_eq!(direct[0].sender_id, "host");
        assert_eq!(direct[0].timestamp, T0);

        let broadcast = fx.queue(BROADCAST_TARGET).await;
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].kind, MessageType::Leave);
    }

    #[tokio::test]
    async fn test_send_prunes_expired_entries() {
        let fx = Fixture::new();
        let viewer = fx.relay("viewer_1");

        viewer.send(MessageType::Join, None, None).await;
        fx.clock.advance(MESSAGE_EXPIRY_MS);
        viewer.send(MessageType::Leave, None, None).await;

        let queue = fx.queue(BROADCAST_TARGET).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, MessageType::Leave);
    }

    #[tokio::test]
    async fn test_concurrent_senders_keep_every_message() {
        let store = Arc::new(InterleavingStore(MemoryStore::new()));
        let clock = Arc::new(ManualClock::new(T0));
        let viewers: Vec<SignalingRelay> = (0..10)
            .map(|i| {
                SignalingRelay::with_config(
                    SESSION,
                    format!("viewer_{}", i),
                    store.clone(),
                    clock.clone(),
                    RelayConfig::default(),
                )
            })
            .collect();

        let sends = viewers
            .iter()
            .map(|relay| relay.send(MessageType::Answer, None, Some("host_1")));
        let results = futures_util::future::join_all(sends).await;
        assert!(results.into_iter().all(|sent| sent));

        let raw = store.get(&queue_key(SESSION, "host_1")).await.unwrap().unwrap();
        let queued: Vec<SignalingMessage> = serde_json::from_str(&raw).unwrap();
        assert_eq!(queued.len(), 10);

        let mut senders: Vec<&str> = queued.iter().map(|m| m.sender_id.as_str()).collect();
        senders.sort();
        senders.dedup();
        assert_eq!(senders.len(), 10);
    }

    #[tokio::test]
    async fn test_poll_dispatches_broadcast_then_direct() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let viewer = fx.relay("viewer_1");

        let order = Arc::new(Mutex::new(Vec::new()));
        for kind in [MessageType::Offer, MessageType::Leave] {
            let order = order.clone();
            viewer.register_handler(kind, move |msg| order.lock().push(msg.kind));
        }

        host.send(MessageType::Offer, None, Some("viewer_1")).await;
        host.send(MessageType::Leave, None, None).await;

        assert_eq!(viewer.poll_once().await, 2);
        assert_eq!(*order.lock(), vec![MessageType::Leave, MessageType::Offer]);
    }

    #[tokio::test]
    async fn test_targeted_message_not_delivered_to_others() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let intended = fx.relay("viewer_1");
        let bystander = fx.relay("viewer_2");

        let got_intended = collector(&intended, MessageType::Offer);
        let got_bystander = collector(&bystander, MessageType::Offer);

        host.send(MessageType::Offer, None, Some("viewer_1")).await;

        bystander.poll_once().await;
        intended.poll_once().await;

        assert_eq!(got_intended.lock().len(), 1);
        assert!(got_bystander.lock().is_empty());
    }

    #[tokio::test]
    async fn test_self_delivery_suppressed() {
        let fx = Fixture::new();
        let viewer = fx.relay("viewer_1");
        let seen = collector(&viewer, MessageType::Join);

        viewer.send(MessageType::Join, None, None).await;
        viewer.send(MessageType::Join, None, Some("viewer_1")).await;

        assert_eq!(viewer.poll_once().await, 0);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_other_sessions_ignored() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let seen = collector(&host, MessageType::Join);

        // A message from another session written into this session's queue
        let stray = SignalingMessage {
            kind: MessageType::Join,
            session_id: "OTHER234".into(),
            sender_id: "viewer_9".into(),
            data: None,
            timestamp: T0,
        };
        fx.store
            .set(
                &queue_key(SESSION, BROADCAST_TARGET),
                serde_json::to_string(&vec![stray]).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(host.poll_once().await, 0);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_expired_message_never_dispatched() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let viewer = fx.relay("viewer_1");
        let seen = collector(&host, MessageType::Join);

        viewer.send(MessageType::Join, None, None).await;
        fx.clock.advance(MESSAGE_EXPIRY_MS);

        // Still physically queued, but too old
        assert_eq!(fx.queue(BROADCAST_TARGET).await.len(), 1);
        assert_eq!(host.poll_once().await, 0);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_until_expiry() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let viewer = fx.relay("viewer_1");
        let seen = collector(&host, MessageType::Join);

        viewer.send(MessageType::Join, None, None).await;

        host.poll_once().await;
        fx.clock.advance(1000);
        host.poll_once().await;
        assert_eq!(seen.lock().len(), 2);

        fx.clock.advance(MESSAGE_EXPIRY_MS);
        host.poll_once().await;
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_multiple_handlers_in_order() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let viewer = fx.relay("viewer_1");

        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let calls = calls.clone();
            host.register_handler(MessageType::Join, move |_| calls.lock().push(name));
        }
        assert_eq!(host.handler_count(MessageType::Join), 2);

        viewer.send(MessageType::Join, None, None).await;
        host.poll_once().await;
        assert_eq!(*calls.lock(), vec!["first", "second"]);

        // set_handler replaces the list
        let replaced = calls.clone();
        host.set_handler(MessageType::Join, move |_| replaced.lock().push("only"));
        assert_eq!(host.handler_count(MessageType::Join), 1);
        host.poll_once().await;
        assert_eq!(calls.lock().last(), Some(&"only"));
    }

    #[tokio::test]
    async fn test_unhandled_types_dropped() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let viewer = fx.relay("viewer_1");

        viewer.send(MessageType::Error, Some(json!({"message": "boom"})), None).await;
        assert_eq!(host.poll_once().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_queues() {
        let fx = Fixture::new();
        let a = fx.relay("viewer_1");
        let b = fx.relay_in("OTHER234", "viewer_2");

        a.send(MessageType::Join, None, None).await;
        b.send(MessageType::Join, None, None).await;
        fx.clock.advance(MESSAGE_EXPIRY_MS - 1);
        a.send(MessageType::Leave, None, None).await;

        fx.clock.advance(1);
        // Session A's queue keeps the leave; session B's queue is gone
        assert_eq!(a.cleanup().await, 1);
        assert_eq!(fx.queue(BROADCAST_TARGET).await.len(), 1);
        assert!(fx
            .store
            .get(&queue_key("OTHER234", BROADCAST_TARGET))
            .await
            .unwrap()
            .is_none());

        fx.clock.advance(MESSAGE_EXPIRY_MS);
        assert_eq!(a.cleanup().await, 1);
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_stops_dispatch() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let viewer = fx.relay("viewer_1");
        let seen = collector(&host, MessageType::Join);

        viewer.send(MessageType::Join, None, None).await;
        host.destroy();
        host.destroy();

        assert!(host.is_destroyed());
        assert_eq!(host.poll_once().await, 0);
        assert!(seen.lock().is_empty());
        assert_eq!(host.handler_count(MessageType::Join), 0);
        assert!(!host.send(MessageType::Leave, None, None).await);
    }

    #[tokio::test]
    async fn test_destroy_from_handler_stops_remaining_dispatch() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let count = Arc::new(AtomicUsize::new(0));

        let relay = host.clone();
        let counter = count.clone();
        host.register_handler(MessageType::Join, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            relay.destroy();
        });

        fx.relay("viewer_1").send(MessageType::Join, None, None).await;
        fx.relay("viewer_2").send(MessageType::Join, None, None).await;

        host.poll_once().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_delivers_within_interval() {
        let fx = Fixture::new();
        let host = fx.relay("host");
        let viewer = fx.relay("viewer_1");
        let seen = collector(&host, MessageType::Join);

        host.start();
        host.start();
        viewer.send(MessageType::Join, None, None).await;

        tokio::time::sleep(std::time::Duration::from_millis(1001)).await;
        assert!(!seen.lock().is_empty());

        host.destroy();
        let before = seen.lock().len();
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(seen.lock().len(), before);
    }
}
