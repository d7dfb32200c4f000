//! Synthetic media transport
//!
//! [`LoopbackTransport`] moves no media. It speaks a minimal SDP dialect with
//! one `a=track:<kind>:<id>` line per track, reports `connected` once both
//! descriptions are in place, and hands the remote side's tracks back as
//! [`TransportEvent::Track`]. It lets the whole negotiation run in tests and
//! from the CLI without a real media stack.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use glimpse_core::{IceCandidate, SdpType, SessionDescription, TransportError};

use crate::transport::{
    LocalTrack, MediaTransport, RemoteTrack, TrackKind, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};

static NEXT_SDP_SESSION: AtomicU64 = AtomicU64::new(1);

/// Step at which a [`LoopbackFactory`] makes its transports fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopbackFailure {
    Offer,
    Answer,
    RemoteDescription,
}

#[derive(Default)]
struct State {
    local_tracks: Vec<LocalTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    gathered: bool,
    connecting: bool,
    connected: bool,
    closed: bool,
}

/// In-process [`MediaTransport`]
pub struct LoopbackTransport {
    events: TransportEvents,
    failure: Option<LoopbackFailure>,
    state: Mutex<State>,
}

impl LoopbackTransport {
    pub fn new(events: TransportEvents, failure: Option<LoopbackFailure>) -> Self {
        Self {
            events,
            failure,
            state: Mutex::new(State::default()),
        }
    }

    pub fn peer_id(&self) -> &str {
        self.events.peer_id()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Candidates applied through `add_ice_candidate`
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Simulate the network path going away
    pub fn drop_connection(&self) {
        self.lose(TransportState::Disconnected);
    }

    /// Simulate ICE giving up on the connection
    pub fn fail_connection(&self) {
        self.lose(TransportState::Failed);
    }

    fn lose(&self, to: TransportState) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.connected = false;
        drop(state);
        self.events.emit(TransportEvent::StateChanged(to));
    }

    fn fails_at(&self, step: LoopbackFailure) -> bool {
        self.failure == Some(step)
    }

    /// Record a local description and queue the events it triggers
    fn set_local(&self, state: &mut State, desc: SessionDescription, out: &mut Vec<TransportEvent>) {
        state.local = Some(desc);
        if !state.gathered {
            state.gathered = true;
            out.push(TransportEvent::IceCandidate(IceCandidate {
                candidate: format!(
                    "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
                    49152 + NEXT_SDP_SESSION.load(Ordering::Relaxed) % 16384
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }));
        }
        self.progress(state, out);
    }

    fn progress(&self, state: &mut State, out: &mut Vec<TransportEvent>) {
        if !state.connecting {
            state.connecting = true;
            out.push(TransportEvent::StateChanged(TransportState::Connecting));
        }
        if !state.connected && state.local.is_some() && state.remote.is_some() {
            state.connected = true;
            out.push(TransportEvent::StateChanged(TransportState::Connected));
        }
    }

    fn flush(&self, out: Vec<TransportEvent>) {
        for event in out {
            self.events.emit(event);
        }
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.fails_at(LoopbackFailure::Offer) {
            return Err(TransportError::Offer("loopback configured to fail".into()));
        }

        let mut out = Vec::new();
        let offer = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            let offer = SessionDescription::offer(render_sdp(&state.local_tracks));
            self.set_local(&mut state, offer.clone(), &mut out);
            offer
        };
        self.flush(out);

        debug!(peer = %self.peer_id(), "Loopback offer created");
        Ok(offer)
    }

    async fn create_answer(
        &self,
        remote: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        if self.fails_at(LoopbackFailure::Answer) {
            return Err(TransportError::Answer("loopback configured to fail".into()));
        }
        if remote.kind != SdpType::Offer {
            return Err(TransportError::Answer("remote description is not an offer".into()));
        }

        self.set_remote_description(remote).await?;

        let mut out = Vec::new();
        let answer = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            let answer = SessionDescription::answer(render_sdp(&state.local_tracks));
            self.set_local(&mut state, answer.clone(), &mut out);
            answer
        };
        self.flush(out);

        debug!(peer = %self.peer_id(), "Loopback answer created");
        Ok(answer)
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), TransportError> {
        if self.fails_at(LoopbackFailure::RemoteDescription) {
            return Err(TransportError::RemoteDescription(
                "loopback configured to fail".into(),
            ));
        }
        let tracks = parse_tracks(&desc.sdp)?;

        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.remote.as_ref() == Some(desc) {
                return Ok(());
            }
            state.remote = Some(desc.clone());
            out.extend(tracks.into_iter().map(TransportEvent::Track));
            self.progress(&mut state, &mut out);
        }
        self.flush(out);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.remote.is_none() {
            return Err(TransportError::IceCandidate(
                "no remote description".into(),
            ));
        }
        state.candidates.push(candidate.clone());
        Ok(())
    }

    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.local_tracks.push(track.clone());
        Ok(())
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.connected = false;
        }
        self.events
            .emit(TransportEvent::StateChanged(TransportState::Closed));
    }
}

/// Render a description advertising `tracks`
fn render_sdp(tracks: &[LocalTrack]) -> String {
    let session = NEXT_SDP_SESSION.fetch_add(1, Ordering::Relaxed);
    let mut sdp = format!(
        "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=glimpse\r\nt=0 0\r\n",
        session
    );
    for track in tracks {
        sdp.push_str(&format!("a=track:{}:{}\r\n", track.kind, track.id));
    }
    sdp
}

/// Parse the tracks advertised by a description
fn parse_tracks(sdp: &str) -> Result<Vec<RemoteTrack>, TransportError> {
    if !sdp.starts_with("v=0") {
        return Err(TransportError::RemoteDescription(
            "missing version line".into(),
        ));
    }

    sdp.lines()
        .filter_map(|line| line.trim_end().strip_prefix("a=track:"))
        .map(|rest| {
            let (kind, id) = rest.split_once(':').ok_or_else(|| {
                TransportError::RemoteDescription(format!("malformed track line: {}", rest))
            })?;
            let kind: TrackKind = kind.parse().map_err(TransportError::RemoteDescription)?;
            Ok(RemoteTrack {
                id: id.to_string(),
                kind,
            })
        })
        .collect()
}

/// Creates [`LoopbackTransport`]s and keeps a weak handle to each
///
/// Transports that their owner has dropped are forgotten.
#[derive(Default)]
pub struct LoopbackFactory {
    failure: Option<LoopbackFailure>,
    live: Mutex<Vec<Weak<LoopbackTransport>>>,
    created: AtomicUsize,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose transports fail at `step`
    pub fn failing(step: LoopbackFailure) -> Self {
        Self {
            failure: Some(step),
            ..Self::default()
        }
    }

    /// Number of transports created so far, dropped ones included
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Transports still held by someone, oldest first
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.live.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// The most recent live transport for `peer_id`
    pub fn transport_for(&self, peer_id: &str) -> Option<Arc<LoopbackTransport>> {
        self.live
            .lock()
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .find(|t| t.peer_id() == peer_id)
    }
}

impl TransportFactory for LoopbackFactory {
    fn create(&self, events: TransportEvents) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let transport = Arc::new(LoopbackTransport::new(events, self.failure));

        let mut live = self.live.lock();
        live.retain(|t| t.strong_count() > 0);
        live.push(Arc::downgrade(&transport));
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(transport as Arc<dyn MediaTransport>)
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::transport::TaggedEvent;

    fn transport(
        peer_id: &str,
    ) -> (LoopbackTransport, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LoopbackTransport::new(TransportEvents::new(peer_id, 0, tx), None), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TaggedEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(tagged) = rx.try_recv() {
            events.push(tagged.event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_connects_both_sides() {
        let (host, mut host_rx) = transport("viewer_1");
        let (viewer, mut viewer_rx) = transport("host_1");

        for track in LocalTrack::screen_capture() {
            host.add_local_track(&track).await.unwrap();
        }

        let offer = host.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("a=track:video:screen"));

        let answer = viewer.create_answer(&offer).await.unwrap();
        assert_eq!(answer.kind, SdpType::Answer);
        assert!(viewer.is_connected());

        let viewer_events = drain(&mut viewer_rx);
        let tracks: Vec<_> = viewer_events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Track(t) => Some(t.kind),
                _ => None,
            })
            .collect();
        assert_eq!(tracks, vec![TrackKind::Video, TrackKind::Audio]);
        assert!(viewer_events.contains(&TransportEvent::StateChanged(TransportState::Connected)));

        host.set_remote_description(&answer).await.unwrap();
        assert!(host.is_connected());

        let host_events = drain(&mut host_rx);
        assert!(matches!(host_events[0], TransportEvent::IceCandidate(_)));
        assert_eq!(
            host_events.last(),
            Some(&TransportEvent::StateChanged(TransportState::Connected))
        );
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let (t, _rx) = transport("viewer_1");
        let candidate = IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 5000 typ host");

        assert!(matches!(
            t.add_ice_candidate(&candidate).await,
            Err(TransportError::IceCandidate(_))
        ));

        t.set_remote_description(&SessionDescription::answer(render_sdp(&[])))
            .await
            .unwrap();
        t.add_ice_candidate(&candidate).await.unwrap();
        assert_eq!(t.candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_malformed_sdp() {
        let (t, _rx) = transport("viewer_1");
        assert!(matches!(
            t.set_remote_description(&SessionDescription::offer("garbage")).await,
            Err(TransportError::RemoteDescription(_))
        ));
        assert!(matches!(
            t.set_remote_description(&SessionDescription::offer("v=0\r\na=track:hologram:x\r\n"))
                .await,
            Err(TransportError::RemoteDescription(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (t, mut rx) = transport("viewer_1");
        t.close().await;
        t.close().await;

        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::StateChanged(TransportState::Closed)]
        );
        assert!(matches!(t.create_offer().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_factory_failure_injection() {
        let factory = LoopbackFactory::failing(LoopbackFailure::Offer);
        let (tx, _rx) = mpsc::unbounded_channel();
        let t = factory
            .create(TransportEvents::new("viewer_1", 0, tx))
            .unwrap();

        assert!(matches!(t.create_offer().await, Err(TransportError::Offer(_))));
        assert!(factory.transport_for("viewer_1").is_some());
        assert!(factory.transport_for("viewer_2").is_none());
    }

    #[tokio::test]
    async fn test_factory_forgets_dropped_transports() {
        let factory = LoopbackFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        for i in 0..50 {
            let t = factory
                .create(TransportEvents::new(format!("viewer_{}", i), i, tx.clone()))
                .unwrap();
            t.close().await;
        }
        let kept = factory
            .create(TransportEvents::new("viewer_kept", 50, tx.clone()))
            .unwrap();

        assert_eq!(factory.created(), 51);
        assert_eq!(factory.transports().len(), 1);
        assert_eq!(factory.live.lock().len(), 1);
        assert!(factory.transport_for("viewer_0").is_none());
        assert!(factory.transport_for("viewer_kept").is_some());
        drop(kept);
        assert!(factory.transports().is_empty());
    }

    #[tokio::test]
    async fn test_fail_connection_reports_failed() {
        let (t, mut rx) = transport("viewer_1");
        t.fail_connection();
        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::StateChanged(TransportState::Failed)]
        );

        // Nothing to lose once closed
        t.close().await;
        drain(&mut rx);
        t.fail_connection();
        assert!(drain(&mut rx).is_empty());
    }
}
