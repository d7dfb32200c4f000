//! Media transport binding
//!
//! The negotiation engine never touches media itself. It drives a
//! [`MediaTransport`] per remote peer, created through a [`TransportFactory`],
//! and reacts to the [`TransportEvent`]s the binding emits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use glimpse_core::{IceCandidate, SessionDescription, TransportError};

/// Kind of a media track
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

impl std::str::FromStr for TrackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(TrackKind::Video),
            "audio" => Ok(TrackKind::Audio),
            other => Err(format!("unknown track kind: {}", other)),
        }
    }
}

/// A track of the host's captured stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Screen video plus system audio
    pub fn screen_capture() -> Vec<LocalTrack> {
        vec![
            LocalTrack::new("screen", TrackKind::Video),
            LocalTrack::new("system-audio", TrackKind::Audio),
        ]
    }
}

/// A track received from the remote peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Connection state reported by a binding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Whether the transport has lost its connection for good
    pub fn is_lost(&self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

/// Asynchronous callback from a binding
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    StateChanged(TransportState),
}

/// A [`TransportEvent`] tagged with the negotiation it belongs to
#[derive(Clone, Debug)]
pub struct TaggedEvent {
    pub peer_id: String,
    /// Distinguishes a regenerated negotiation from the one it replaced
    pub generation: u64,
    pub event: TransportEvent,
}

/// Handle a binding uses to report events for one negotiation
#[derive(Clone, Debug)]
pub struct TransportEvents {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl TransportEvents {
    pub fn new(
        peer_id: impl Into<String>,
        generation: u64,
        tx: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Report an event; returns `false` once nobody is listening
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One peer-to-peer media connection
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Produce an offer covering every local track added so far
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Produce an answer to `remote`
    async fn create_answer(
        &self,
        remote: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Release the connection; closing twice is a no-op
    async fn close(&self);
}

/// Creates a transport for each negotiation
pub trait TransportFactory: Send + Sync {
    fn create(&self, events: TransportEvents) -> Result<Arc<dyn MediaTransport>, TransportError>;

    /// Get the name of this binding for logging
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind_parsing() {
        assert_eq!("video".parse::<TrackKind>().unwrap(), TrackKind::Video);
        assert_eq!(TrackKind::Audio.to_string(), "audio");
        assert!("subtitles".parse::<TrackKind>().is_err());
    }

    #[test]
    fn test_events_are_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new("viewer_1", 3, tx);

        assert!(events.emit(TransportEvent::StateChanged(TransportState::Connecting)));

        let tagged = rx.try_recv().unwrap();
        assert_eq!(tagged.peer_id, "viewer_1");
        assert_eq!(tagged.generation, 3);
        assert_eq!(
            tagged.event,
            TransportEvent::StateChanged(TransportState::Connecting)
        );

        drop(rx);
        assert!(!events.emit(TransportEvent::StateChanged(TransportState::Closed)));
    }

    #[test]
    fn test_lost_states() {
        assert!(TransportState::Failed.is_lost());
        assert!(TransportState::Disconnected.is_lost());
        assert!(!TransportState::Closed.is_lost());
        assert!(!TransportState::Connected.is_lost());
    }
}
