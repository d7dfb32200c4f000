//! Glimpse Signal - session registry and store-and-poll signaling
//!
//! Hosts and viewers never talk directly until negotiation completes. Everything
//! they exchange before that goes through a shared key/value store:
//!
//! 1. Host creates a session record in the [`SessionRegistry`] and gets a code
//! 2. Viewer looks the code up and adds itself to the viewer list
//! 3. Both sides run a [`SignalingRelay`] that appends messages to per-target
//!    queues in the store and polls the queues addressed to them
//! 4. Once offer, answer, and ICE candidates are through, media flows directly
//!
//! The store can be in-process ([`glimpse_core::MemoryStore`]), a SQLite file
//! ([`SqliteStore`]), or a [`StoreServer`] reached through [`RemoteStore`].

pub mod client;
pub mod messages;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;

pub use client::RemoteStore;
pub use messages::{StoreOp, StoreRequest, StoreResponse, StoreResult};
pub use registry::SessionRegistry;
pub use relay::{MessageHandler, SignalingRelay};
pub use server::StoreServer;
pub use storage::SqliteStore;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8080;
