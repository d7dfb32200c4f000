//! Peer negotiation state machine
//!
//! One [`NegotiationEngine`] runs per endpoint. It owns a negotiation record
//! per remote peer and drives offer/answer/ICE exchange over a
//! [`SignalingRelay`]:
//!
//! ```text
//!   Host                         relay                          Viewer
//!    │                             │   join (broadcast)           │
//!    │ ◄─────────────────────────────────────────────────────────│
//!    │  offer{sdp} → viewer        │                              │
//!    │ ─────────────────────────────────────────────────────────►│
//!    │                             │   answer{sdp} → host         │
//!    │ ◄─────────────────────────────────────────────────────────│
//!    │  ice-candidate ⇄            │                              │
//! ```
//!
//! Relay handlers, transport callbacks, and local commands all feed channels
//! drained by a single task, so records are only ever touched from one place.
//!
//! The relay delivers at least once, so every handler here is idempotent:
//! repeated joins, offers, answers, and candidates leave the state unchanged.
//!
//! When a negotiation fails locally the remote peer is told with an `error`
//! message carrying a wire [`ErrorCode`](glimpse_core::ErrorCode), and ends
//! its side of the negotiation too.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use glimpse_core::{
    CandidatePayload, ErrorPayload, IceCandidate, MessageType, SdpPayload, SdpType,
    SessionDescription, SessionError, SignalingMessage, TransportError,
};
use glimpse_signal::SignalingRelay;

use crate::transport::{
    LocalTrack, MediaTransport, RemoteTrack, TaggedEvent, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};

/// State of one negotiation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Which side of the session this endpoint plays
#[derive(Clone, Debug)]
pub enum Role {
    /// Publishes `tracks` to every viewer that joins
    Host { tracks: Vec<LocalTrack> },
    /// Receives from the session's host
    Viewer { host_id: String },
}

/// Why a peer's negotiation ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent `leave`
    Left,
    /// The transport reported `disconnected`
    Disconnected,
    /// Negotiation or the transport failed
    Failed(String),
}

/// Notification from the engine to its orchestrator
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    Negotiating { peer_id: String },
    Connected { peer_id: String },
    Track { peer_id: String, track: RemoteTrack },
    Disconnected { peer_id: String, reason: DisconnectReason },
}

/// Point-in-time view of one negotiation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub state: NegotiationState,
}

enum Command {
    Join,
    Snapshot(oneshot::Sender<Vec<PeerSnapshot>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running negotiation task
pub struct NegotiationEngine {
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl NegotiationEngine {
    /// Register on `relay` and start the negotiation task
    ///
    /// The relay's poll loop is left to the caller.
    pub fn start(
        relay: &SignalingRelay,
        role: Role,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (message_tx, message_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        for kind in [
            MessageType::Join,
            MessageType::Leave,
            MessageType::Offer,
            MessageType::Answer,
            MessageType::IceCandidate,
            MessageType::Error,
        ] {
            let tx = message_tx.clone();
            relay.register_handler(kind, move |msg| {
                let _ = tx.send(msg.clone());
            });
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            session = %relay.session_id(),
            peer = %relay.peer_id(),
            binding = factory.name(),
            "Negotiation engine started as {}",
            match &role {
                Role::Host { .. } => "host",
                Role::Viewer { .. } => "viewer",
            }
        );

        let negotiator = Negotiator {
            relay: relay.clone(),
            role,
            factory,
            records: HashMap::new(),
            retired: HashMap::new(),
            next_generation: 0,
            join_sent: false,
            transport_tx,
            events: event_tx,
        };
        let task = tokio::spawn(negotiator.run(command_rx, message_rx, transport_rx));

        let engine = Self {
            commands: command_tx,
            task: Mutex::new(Some(task)),
            shut_down: AtomicBool::new(false),
        };
        (engine, event_rx)
    }

    /// Viewer only: announce this endpoint to the host
    pub fn request_join(&self) -> bool {
        self.commands.send(Command::Join).is_ok()
    }

    /// Every live negotiation, plus finished ones whose messages may still be queued
    ///
    /// Messages already handed over by the relay are processed first.
    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn peer_state(&self, peer_id: &str) -> Option<NegotiationState> {
        self.peers()
            .await
            .into_iter()
            .find(|p| p.peer_id == peer_id)
            .map(|p| p.state)
    }

    /// Close every transport and stop the task; safe to call more than once
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        self.task.lock().take();
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Run-time state of one negotiation
struct PeerRecord {
    generation: u64,
    transport: Arc<dyn MediaTransport>,
    state: NegotiationState,
    /// Offer this record answered and when it was sent (viewer side)
    remote_offer: Option<(String, i64)>,
    remote_applied: bool,
    candidates: HashSet<IceCandidate>,
}

impl PeerRecord {
    fn new(generation: u64, transport: Arc<dyn MediaTransport>) -> Self {
        Self {
            generation,
            transport,
            state: NegotiationState::Idle,
            remote_offer: None,
            remote_applied: false,
            candidates: HashSet::new(),
        }
    }
}

/// A negotiation that ended, kept until its peer's messages have expired
struct Retired {
    state: NegotiationState,
    /// Relay clock time of retirement, epoch milliseconds
    at: i64,
}

/// State owned by the engine task
struct Negotiator {
    relay: SignalingRelay,
    role: Role,
    factory: Arc<dyn TransportFactory>,
    records: HashMap<String, PeerRecord>,
    retired: HashMap<String, Retired>,
    next_generation: u64,
    join_sent: bool,
    transport_tx: mpsc::UnboundedSender<TaggedEvent>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Negotiator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut messages: mpsc::UnboundedReceiver<SignalingMessage>,
        mut transport: mpsc::UnboundedReceiver<TaggedEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(msg) = messages.recv() => {
                    self.prune_retired();
                    self.on_message(msg).await;
                }
                Some(tagged) = transport.recv() => self.on_transport_event(tagged).await,
                command = commands.recv() => match command {
                    Some(Command::Join) => self.send_join().await,
                    Some(Command::Snapshot(reply)) => {
                        self.prune_retired();
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.close_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.close_all().await;
                        break;
                    }
                },
            }
        }

        debug!(peer = %self.relay.peer_id(), "Negotiation engine stopped");
    }

    fn is_host(&self) -> bool {
        matches!(self.role, Role::Host { .. })
    }

    fn host_id(&self) -> Option<&str> {
        match &self.role {
            Role::Viewer { host_id } => Some(host_id),
            Role::Host { .. } => None,
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    async fn on_message(&mut self, msg: SignalingMessage) {
        if self.is_host() {
            match msg.kind {
                MessageType::Join => self.on_join(&msg.sender_id).await,
                MessageType::Answer => self.on_answer(&msg).await,
                MessageType::IceCandidate => self.on_remote_candidate(&msg).await,
                MessageType::Leave => self.on_peer_left(&msg.sender_id).await,
                MessageType::Error => self.on_peer_error(&msg).await,
                _ => debug!(from = %msg.sender_id, "Host ignoring {} message", msg.kind),
            }
            return;
        }

        if self.host_id() != Some(msg.sender_id.as_str()) {
            debug!(from = %msg.sender_id, "Viewer ignoring {} from non-host", msg.kind);
            return;
        }

        match msg.kind {
            MessageType::Offer => self.on_offer(&msg).await,
            MessageType::IceCandidate => self.on_remote_candidate(&msg).await,
            MessageType::Leave => self.on_peer_left(&msg.sender_id).await,
            MessageType::Error => self.on_peer_error(&msg).await,
            _ => debug!("Viewer ignoring {} from host", msg.kind),
        }
    }

    /// Host: a viewer asked to join
    async fn on_join(&mut self, peer_id: &str) {
        if self.records.contains_key(peer_id) {
            debug!(peer = %peer_id, "Duplicate join ignored");
            return;
        }
        if self.retired.contains_key(peer_id) {
            debug!(peer = %peer_id, "Join from retired peer ignored");
            return;
        }

        let transport = match self.open_record(peer_id) {
            Ok(transport) => transport,
            Err(e) => return self.fail(peer_id, e).await,
        };

        let tracks = match &self.role {
            Role::Host { tracks } => tracks.clone(),
            Role::Viewer { .. } => Vec::new(),
        };

        let offer = async {
            for track in &tracks {
                transport.add_local_track(track).await?;
            }
            transport.create_offer().await
        }
        .await;

        match offer {
            Ok(offer) => {
                if let Some(record) = self.records.get_mut(peer_id) {
                    record.state = NegotiationState::Negotiating;
                }
                self.send(MessageType::Offer, &SdpPayload { sdp: offer }, peer_id)
                    .await;
                info!(peer = %peer_id, "Offer sent");
                self.emit(EngineEvent::Negotiating {
                    peer_id: peer_id.to_string(),
                });
            }
            Err(e) => self.fail(peer_id, e).await,
        }
    }

    /// Host: a viewer answered our offer
    async fn on_answer(&mut self, msg: &SignalingMessage) {
        let peer_id = msg.sender_id.as_str();
        let Some(record) = self.records.get(peer_id) else {
            debug!(peer = %peer_id, "Answer without negotiation ignored");
            return;
        };
        if record.remote_applied {
            return;
        }

        let Some(answer) = description(msg, SdpType::Answer) else {
            warn!(peer = %peer_id, "Malformed answer ignored");
            return;
        };

        let transport = record.transport.clone();
        match transport.set_remote_description(&answer).await {
            Ok(()) => {
                if let Some(record) = self.records.get_mut(peer_id) {
                    record.remote_applied = true;
                }
                debug!(peer = %peer_id, "Answer applied");
            }
            Err(e) => self.fail(peer_id, e).await,
        }
    }

    /// Viewer: the host sent an offer
    async fn on_offer(&mut self, msg: &SignalingMessage) {
        let host_id = msg.sender_id.as_str();
        if self.retired.contains_key(host_id) {
            return;
        }

        let Some(offer) = description(msg, SdpType::Offer) else {
            warn!(host = %host_id, "Malformed offer ignored");
            return;
        };

        if let Some(record) = self.records.get(host_id) {
            match &record.remote_offer {
                Some((sdp, _)) if *sdp == offer.sdp => return,
                // Older offers stay queued until they expire
                Some((_, sent_at)) if msg.timestamp <= *sent_at => return,
                _ => {}
            }
            info!(host = %host_id, "New offer from host, renegotiating");
            if let Some(old) = self.records.remove(host_id) {
                old.transport.close().await;
            }
        }

        let transport = match self.open_record(host_id) {
            Ok(transport) => transport,
            Err(e) => return self.fail(host_id, e).await,
        };
        if let Some(record) = self.records.get_mut(host_id) {
            record.state = NegotiationState::Negotiating;
        }

        let answer = async {
            transport.set_remote_description(&offer).await?;
            transport.create_answer(&offer).await
        }
        .await;

        match answer {
            Ok(answer) => {
                if let Some(record) = self.records.get_mut(host_id) {
                    record.remote_offer = Some((offer.sdp.clone(), msg.timestamp));
                    record.remote_applied = true;
                }
                self.send(MessageType::Answer, &SdpPayload { sdp: answer }, host_id)
                    .await;
                info!(host = %host_id, "Answer sent");
            }
            Err(e) => self.fail(host_id, e).await,
        }
    }

    /// Either role: apply a candidate from the remote peer
    async fn on_remote_candidate(&mut self, msg: &SignalingMessage) {
        let peer_id = msg.sender_id.as_str();
        let Some(record) = self.records.get(peer_id) else {
            debug!(peer = %peer_id, "Candidate for unknown peer dropped");
            return;
        };
        // Redelivery brings it back once the description is in place
        if !record.remote_applied {
            return;
        }

        let Some(CandidatePayload { candidate }) = msg.payload::<CandidatePayload>() else {
            warn!(peer = %peer_id, "Malformed ICE candidate ignored");
            return;
        };
        if record.candidates.contains(&candidate) {
            return;
        }

        let transport = record.transport.clone();
        match transport.add_ice_candidate(&candidate).await {
            Ok(()) => {
                if let Some(record) = self.records.get_mut(peer_id) {
                    record.candidates.insert(candidate);
                }
            }
            Err(e) => warn!(peer = %peer_id, "Could not apply ICE candidate: {}", e),
        }
    }

    /// Either role: the remote peer sent `leave`
    async fn on_peer_left(&mut self, peer_id: &str) {
        if self.retired.contains_key(peer_id) {
            return;
        }

        if let Some(record) = self.records.remove(peer_id) {
            record.transport.close().await;
        }
        self.retire(peer_id, NegotiationState::Closed);

        info!(peer = %peer_id, "Peer left");
        self.emit(EngineEvent::Disconnected {
            peer_id: peer_id.to_string(),
            reason: DisconnectReason::Left,
        });
    }

    /// Either role: the remote peer gave up on the negotiation with us
    async fn on_peer_error(&mut self, msg: &SignalingMessage) {
        let peer_id = msg.sender_id.as_str();
        if self.retired.contains_key(peer_id) {
            return;
        }

        let (code, detail) = match msg.payload::<ErrorPayload>() {
            Some(ErrorPayload { code, message }) => (code, message),
            None => (None, String::new()),
        };
        warn!(from = %peer_id, ?code, "Peer reported error: {}", detail);

        // A viewer has a negotiation with its host as soon as it asked to join
        let negotiating =
            self.records.contains_key(peer_id) || (!self.is_host() && self.join_sent);
        if !negotiating {
            return;
        }

        if let Some(record) = self.records.remove(peer_id) {
            record.transport.close().await;
        }
        self.retire(peer_id, NegotiationState::Failed);
        self.emit(EngineEvent::Disconnected {
            peer_id: peer_id.to_string(),
            reason: DisconnectReason::Failed(format!("peer reported: {}", detail)),
        });
    }

    /// Viewer: announce ourselves to the host
    async fn send_join(&mut self) {
        let Some(host_id) = self.host_id().map(str::to_string) else {
            warn!("Join requested on a host engine");
            return;
        };
        if self.join_sent {
            return;
        }

        if !self.relay.send(MessageType::Join, None, None).await {
            warn!("Join could not be sent");
        }
        self.join_sent = true;
        self.emit(EngineEvent::Negotiating { peer_id: host_id });
    }

    async fn on_transport_event(&mut self, tagged: TaggedEvent) {
        let TaggedEvent {
            peer_id,
            generation,
            event,
        } = tagged;

        let Some(record) = self.records.get_mut(&peer_id) else {
            return;
        };
        if record.generation != generation {
            // Left over from a negotiation that was replaced
            return;
        }

        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.send(MessageType::IceCandidate, &CandidatePayload { candidate }, &peer_id)
                    .await;
            }
            TransportEvent::Track(track) => {
                if self.is_host() {
                    debug!(peer = %peer_id, "Host ignoring inbound track {}", track.id);
                } else {
                    info!(peer = %peer_id, "Remote {} track {}", track.kind, track.id);
                    self.emit(EngineEvent::Track { peer_id, track });
                }
            }
            TransportEvent::StateChanged(TransportState::Connected) => {
                if record.state != NegotiationState::Connected {
                    record.state = NegotiationState::Connected;
                    info!(peer = %peer_id, "Peer connected");
                    self.emit(EngineEvent::Connected { peer_id });
                }
            }
            TransportEvent::StateChanged(state) if state.is_lost() => {
                let failed = state == TransportState::Failed;
                if let Some(record) = self.records.remove(&peer_id) {
                    record.transport.close().await;
                }
                let (final_state, reason) = if failed {
                    (
                        NegotiationState::Failed,
                        DisconnectReason::Failed("transport failed".into()),
                    )
                } else {
                    (NegotiationState::Closed, DisconnectReason::Disconnected)
                };
                self.retire(&peer_id, final_state);

                warn!(peer = %peer_id, "Transport lost ({:?})", state);
                self.emit(EngineEvent::Disconnected { peer_id, reason });
            }
            TransportEvent::StateChanged(state) => {
                debug!(peer = %peer_id, "Transport state {:?}", state);
            }
        }
    }

    /// Create a transport and an idle record for `peer_id`
    fn open_record(&mut self, peer_id: &str) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let events = TransportEvents::new(peer_id, generation, self.transport_tx.clone());
        let transport = self.factory.create(events)?;
        self.records.insert(
            peer_id.to_string(),
            PeerRecord::new(generation, transport.clone()),
        );
        Ok(transport)
    }

    /// Tear down a negotiation after a local transport error and tell the peer
    async fn fail(&mut self, peer_id: &str, error: TransportError) {
        if let Some(record) = self.records.remove(peer_id) {
            record.transport.close().await;
        }

        warn!(peer = %peer_id, "Negotiation failed: {}", error);
        let message = error.to_string();
        let report = ErrorPayload {
            code: Some(SessionError::from(error).code()),
            message: message.clone(),
        };
        self.send(MessageType::Error, &report, peer_id).await;

        self.retire(peer_id, NegotiationState::Failed);
        self.emit(EngineEvent::Disconnected {
            peer_id: peer_id.to_string(),
            reason: DisconnectReason::Failed(message),
        });
    }

    fn retire(&mut self, peer_id: &str, state: NegotiationState) {
        let at = self.relay.clock().now_ms();
        self.retired.insert(peer_id.to_string(), Retired { state, at });
    }

    /// Host: forget finished negotiations once their peer's messages have expired
    ///
    /// A viewer only ever negotiates with its host and keeps that entry.
    fn prune_retired(&mut self) {
        if !self.is_host() {
            return;
        }
        let now = self.relay.clock().now_ms();
        let expiry = self.relay.config().message_expiry_ms;
        self.retired.retain(|_, retired| now - retired.at < expiry);
    }

    async fn close_all(&mut self) {
        let closed: Vec<(String, PeerRecord)> = self.records.drain().collect();
        for (peer_id, record) in closed {
            record.transport.close().await;
            self.retire(&peer_id, NegotiationState::Closed);
        }
    }

    /// Fire-and-forget send of a typed payload to one peer
    async fn send<T: Serialize>(&self, kind: MessageType, payload: &T, target: &str) {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode {} payload: {}", kind, e);
                return;
            }
        };
        if !self.relay.send(kind, Some(data), Some(target)).await {
            warn!(to = %target, "Failed to send {}", kind);
        }
    }

    fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .records
            .iter()
            .map(|(peer_id, record)| PeerSnapshot {
                peer_id: peer_id.clone(),
                state: record.state,
            })
            .chain(self.retired.iter().map(|(peer_id, retired)| PeerSnapshot {
                peer_id: peer_id.clone(),
                state: retired.state,
            }))
            .collect();

        // A viewer that has asked to join is negotiating before any record exists
        if let Some(host_id) = self.host_id() {
            if self.join_sent && !peers.iter().any(|p| p.peer_id == host_id) {
                peers.push(PeerSnapshot {
                    peer_id: host_id.to_string(),
                    state: NegotiationState::Negotiating,
                });
            }
        }

        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}

/// Decode an offer/answer payload of the expected type
fn description(msg: &SignalingMessage, expected: SdpType) -> Option<SessionDescription> {
    msg.payload::<SdpPayload>()
        .map(|p| p.sdp)
        .filter(|sdp| sdp.kind == expected)
}
