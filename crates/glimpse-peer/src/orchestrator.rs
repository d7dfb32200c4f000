//! Host and viewer session lifecycles
//!
//! A [`HostSession`] publishes a session record, answers joins with offers,
//! and marks the session inactive when stopped. A [`ViewerSession`] resolves
//! a code, registers as a viewer, and negotiates with the host. Losing the
//! host makes the viewer leave on its own after a short grace period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use glimpse_core::code::{extract_session_id, format_session_id, generate_peer_id, make_share_link};
use glimpse_core::{
    Clock, GlimpseConfig, KvStore, MessageType, Session, SessionError, SessionMetadata,
    SessionStatus, SystemClock,
};
use glimpse_signal::{SessionRegistry, SignalingRelay};

use crate::negotiation::{
    DisconnectReason, EngineEvent, NegotiationEngine, PeerSnapshot, Role,
};
use crate::transport::{LocalTrack, RemoteTrack, TransportFactory};

const EVENT_CAPACITY: usize = 64;

/// Everything a session needs from its environment
#[derive(Clone)]
pub struct GlimpseContext {
    registry: SessionRegistry,
    config: GlimpseConfig,
    factory: Arc<dyn TransportFactory>,
}

impl GlimpseContext {
    pub fn new(store: Arc<dyn KvStore>, factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_config(store, Arc::new(SystemClock), GlimpseConfig::default(), factory)
    }

    pub fn with_config(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        config: GlimpseConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let registry = SessionRegistry::with_config(store, clock, config.session.clone());
        Self {
            registry,
            config,
            factory,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &GlimpseConfig {
        &self.config
    }

    /// A relay for `peer_id` sharing this context's store and clock
    pub fn relay(&self, session_id: &str, peer_id: &str) -> SignalingRelay {
        SignalingRelay::with_config(
            session_id,
            peer_id,
            self.registry.store().clone(),
            self.registry.clock().clone(),
            self.config.relay.clone(),
        )
    }
}

/// Viewer-side connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Lifecycle notification for the UI
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Host: a viewer asked to join and negotiation started
    ViewerJoined { viewer_id: String },
    /// Host: media is flowing to a viewer
    ViewerConnected { viewer_id: String },
    /// Host: a viewer's negotiation ended
    ViewerLeft {
        viewer_id: String,
        reason: DisconnectReason,
    },
    /// Viewer: connection state changed
    StateChanged(ConnectionState),
    /// Viewer: a track arrived from the host
    RemoteTrack(RemoteTrack),
    /// Viewer: the host left or the connection dropped
    HostLost { reason: DisconnectReason },
    /// Either side: the session is over for this endpoint
    Ended,
}

// ============================================================================
// Host
// ============================================================================

/// A running broadcast
pub struct HostSession {
    ctx: GlimpseContext,
    session: Session,
    relay: SignalingRelay,
    engine: NegotiationEngine,
    events: broadcast::Sender<SessionEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl HostSession {
    /// Publish a new session and start answering joins
    pub async fn start(
        ctx: &GlimpseContext,
        metadata: Option<SessionMetadata>,
        tracks: Vec<LocalTrack>,
    ) -> Self {
        let host_id = generate_peer_id("host");
        let session = ctx.registry.create_session(&host_id, metadata).await;

        let relay = ctx.relay(&session.id, &host_id);
        let (engine, engine_events) =
            NegotiationEngine::start(&relay, Role::Host { tracks }, ctx.factory.clone());
        relay.start();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pump = tokio::spawn(run_host_pump(
            ctx.registry.clone(),
            session.id.clone(),
            engine_events,
            events.clone(),
        ));

        info!(
            session = %format_session_id(&session.id),
            host = %host_id,
            "Hosting at {}",
            make_share_link(&ctx.config.client.share_base_url, &session.id)
        );

        Self {
            ctx: ctx.clone(),
            session,
            relay,
            engine,
            events,
            pump: Mutex::new(Some(pump)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn host_id(&self) -> &str {
        &self.session.host_id
    }

    /// Display form of the code (e.g., "BA7Z-UM4E")
    pub fn code(&self) -> String {
        format_session_id(&self.session.id)
    }

    pub fn share_link(&self) -> String {
        make_share_link(&self.ctx.config.client.share_base_url, &self.session.id)
    }

    /// Events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Negotiation state of every viewer seen so far
    pub async fn viewers(&self) -> Vec<PeerSnapshot> {
        self.engine.peers().await
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// End the broadcast; safe to call more than once
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.relay.send(MessageType::Leave, None, None).await {
            warn!(session = %self.session.id, "Could not announce host leave");
        }
        self.engine.shutdown().await;
        self.relay.destroy();

        if !self
            .ctx
            .registry
            .update_status(&self.session.id, SessionStatus::Inactive)
            .await
        {
            warn!(session = %self.session.id, "Session record missing on stop");
        }

        info!(session = %format_session_id(&self.session.id), "Broadcast stopped");
        let _ = self.events.send(SessionEvent::Ended);
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn run_host_pump(
    registry: SessionRegistry,
    session_id: String,
    mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    events: broadcast::Sender<SessionEvent>,
) {
    while let Some(event) = engine_events.recv().await {
        let out = match event {
            EngineEvent::Negotiating { peer_id } => SessionEvent::ViewerJoined { viewer_id: peer_id },
            EngineEvent::Connected { peer_id } => SessionEvent::ViewerConnected { viewer_id: peer_id },
            EngineEvent::Track { .. } => continue,
            EngineEvent::Disconnected { peer_id, reason } => {
                registry.remove_viewer(&session_id, &peer_id).await;
                info!(viewer = %peer_id, "Viewer removed ({:?})", reason);
                SessionEvent::ViewerLeft {
                    viewer_id: peer_id,
                    reason,
                }
            }
        };
        let _ = events.send(out);
    }
}

// ============================================================================
// Viewer
// ============================================================================

/// A viewer's connection to one broadcast
pub struct ViewerSession {
    inner: Arc<ViewerInner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

struct ViewerInner {
    registry: SessionRegistry,
    session_id: String,
    viewer_id: String,
    host_id: String,
    relay: SignalingRelay,
    engine: NegotiationEngine,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    auto_leave_grace: Duration,
    left: AtomicBool,
}

impl ViewerSession {
    /// Join the session named by `input` (a code in any case, with or without
    /// the dash, or a share link)
    ///
    /// Nothing is registered and no signaling starts unless every check passes.
    pub async fn join(ctx: &GlimpseContext, input: &str) -> Result<Self, SessionError> {
        let session_id = extract_session_id(input)
            .ok_or_else(|| SessionError::InvalidFormat(input.trim().to_string()))?;

        let session = ctx
            .registry
            .get_session(&session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        if session.status != SessionStatus::Active {
            return Err(SessionError::NotActive(session_id));
        }

        let viewer_id = generate_peer_id("viewer");
        let session = ctx.registry.try_add_viewer(&session_id, &viewer_id).await?;

        let relay = ctx.relay(&session_id, &viewer_id);
        let (engine, engine_events) = NegotiationEngine::start(
            &relay,
            Role::Viewer {
                host_id: session.host_id.clone(),
            },
            ctx.factory.clone(),
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(ViewerInner {
            registry: ctx.registry.clone(),
            session_id,
            viewer_id,
            host_id: session.host_id,
            relay,
            engine,
            events,
            state,
            auto_leave_grace: ctx.config.viewer.auto_leave_grace(),
            left: AtomicBool::new(false),
        });

        let pump = tokio::spawn(run_viewer_pump(Arc::downgrade(&inner), engine_events));
        inner.relay.start();
        inner.engine.request_join();

        info!(
            session = %format_session_id(&inner.session_id),
            viewer = %inner.viewer_id,
            "Joined session"
        );

        Ok(Self {
            inner,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn viewer_id(&self) -> &str {
        &self.inner.viewer_id
    }

    pub fn host_id(&self) -> &str {
        &self.inner.host_id
    }

    pub fn code(&self) -> String {
        format_session_id(&self.inner.session_id)
    }

    /// Events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Follow connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn has_left(&self) -> bool {
        self.inner.left.load(Ordering::SeqCst)
    }

    /// Leave the session; safe to call more than once
    pub async fn leave(&self) {
        self.inner.leave().await;
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

impl ViewerInner {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(viewer = %self.viewer_id, "Connection state {:?}", state);
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }

    async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self
            .relay
            .send(MessageType::Leave, None, Some(&self.host_id))
            .await
        {
            warn!(viewer = %self.viewer_id, "Could not notify host of leave");
        }
        self.engine.shutdown().await;
        self.relay.destroy();
        self.registry
            .remove_viewer(&self.session_id, &self.viewer_id)
            .await;

        if *self.state.borrow() != ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
        }

        info!(viewer = %self.viewer_id, "Left session {}", format_session_id(&self.session_id));
        let _ = self.events.send(SessionEvent::Ended);
    }
}

async fn run_viewer_pump(
    inner: Weak<ViewerInner>,
    mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    while let Some(event) = engine_events.recv().await {
        let Some(viewer) = inner.upgrade() else {
            break;
        };

        match event {
            EngineEvent::Negotiating { .. } => viewer.set_state(ConnectionState::Connecting),
            EngineEvent::Connected { .. } => viewer.set_state(ConnectionState::Connected),
            EngineEvent::Track { track, .. } => {
                let _ = viewer.events.send(SessionEvent::RemoteTrack(track));
            }
            EngineEvent::Disconnected { reason, .. } => {
                let state = match reason {
                    DisconnectReason::Failed(_) => ConnectionState::Failed,
                    _ => ConnectionState::Disconnected,
                };
                viewer.set_state(state);
                let _ = viewer.events.send(SessionEvent::HostLost {
                    reason: reason.clone(),
                });

                warn!(viewer = %viewer.viewer_id, "Lost host ({:?}), leaving", reason);
                let grace = viewer.auto_leave_grace;
                drop(viewer);

                tokio::time::sleep(grace).await;
                if let Some(viewer) = inner.upgrade() {
                    viewer.leave().await;
                }
                break;
            }
        }
    }
}
