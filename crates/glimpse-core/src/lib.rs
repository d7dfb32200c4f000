//! Glimpse Core - Shared types, session codes, and the store abstraction
//!
//! This crate contains the foundational types used across all Glimpse components.
//! It has no dependencies on networking code.

pub mod clock;
pub mod code;
pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ClientConfig, ConfigError, GlimpseConfig, RelayConfig, SessionConfig, SignalConfig,
    ViewerConfig,
};
pub use error::*;
pub use store::{KvStore, MemoryStore};
pub use types::*;

/// Key prefix for session records
pub const SESSION_PREFIX: &str = "glimpse_session_";

/// Key prefix for signaling queues
pub const SIGNALING_PREFIX: &str = "glimpse_signaling_";

/// Target name of the queue every peer in a session reads
pub const BROADCAST_TARGET: &str = "broadcast";

/// Session lifetime in milliseconds (24 hours)
pub const SESSION_EXPIRY_MS: i64 = 24 * 60 * 60 * 1000;

/// Signaling message lifetime in milliseconds (30 seconds)
pub const MESSAGE_EXPIRY_MS: i64 = 30 * 1000;

/// Interval between registry expiry sweeps in seconds (1 hour)
pub const SWEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Interval between relay polls in milliseconds
pub const POLL_INTERVAL_MS: u64 = 1000;

/// Delay before a viewer leaves after losing the host, in milliseconds
pub const AUTO_LEAVE_GRACE_MS: u64 = 2000;

/// Storage key of a session record
pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, session_id)
}

/// Storage key of a signaling queue (`target` is a peer ID or [`BROADCAST_TARGET`])
pub fn queue_key(session_id: &str, target: &str) -> String {
    format!("{}{}_{}", SIGNALING_PREFIX, session_id, target)
}
