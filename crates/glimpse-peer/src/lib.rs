//! Glimpse Peer - negotiation and session orchestration
//!
//! Sits on top of [`glimpse_signal`]: a [`NegotiationEngine`] turns relay
//! messages into offer/answer/ICE exchanges against a [`MediaTransport`], and
//! [`HostSession`] / [`ViewerSession`] wire the registry, relay, and engine
//! into the two user-facing lifecycles.
//!
//! Media itself is behind the [`TransportFactory`] seam. [`LoopbackFactory`]
//! is an in-process binding that negotiates without moving media.

pub mod loopback;
pub mod negotiation;
pub mod orchestrator;
pub mod transport;

pub use loopback::{LoopbackFactory, LoopbackFailure, LoopbackTransport};
pub use negotiation::{
    DisconnectReason, EngineEvent, NegotiationEngine, NegotiationState, PeerSnapshot, Role,
};
pub use orchestrator::{ConnectionState, GlimpseContext, HostSession, SessionEvent, ViewerSession};
pub use transport::{
    LocalTrack, MediaTransport, RemoteTrack, TaggedEvent, TrackKind, TransportEvent,
    TransportEvents, TransportFactory, TransportState,
};
