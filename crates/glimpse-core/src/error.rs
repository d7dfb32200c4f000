//! Error types for Glimpse sessions and storage

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to the orchestrator and UI
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Invalid session ID format")]
    InvalidFormat(String),

    #[error("Session not found or expired")]
    NotFound(String),

    #[error("Session is not active")]
    NotActive(String),

    #[error("Session is full ({max} viewers)")]
    Capacity { max: u32 },

    #[error("media transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("storage failed: {0}")]
    Storage(#[from] StoreError),
}

impl SessionError {
    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }
}

/// Errors raised by a `KvStore` backend
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("lock poisoned: a thread panicked while holding the lock")]
    LockPoisoned,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("connection to store failed: {0}")]
    Connection(String),

    #[error("store request timed out")]
    Timeout,

    #[error("remote store error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("too many concurrent writers on {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors raised by a media transport binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to create offer: {0}")]
    Offer(String),

    #[error("failed to create answer: {0}")]
    Answer(String),

    #[error("invalid remote description: {0}")]
    RemoteDescription(String),

    #[error("invalid ICE candidate: {0}")]
    IceCandidate(String),

    #[error("failed to add local track: {0}")]
    Track(String),

    #[error("transport closed")]
    Closed,
}

/// Wire error codes (sent over the store protocol and in `error` signaling messages)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidFormat,
    NotFound,
    NotActive,
    Capacity,
    TransportFailure,
    StorageFailure,
    InvalidRequest,
}

impl From<&SessionError> for ErrorCode {
    fn from(e: &SessionError) -> Self {
        match e {
            SessionError::InvalidFormat(_) => ErrorCode::InvalidFormat,
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::NotActive(_) => ErrorCode::NotActive,
            SessionError::Capacity { .. } => ErrorCode::Capacity,
            SessionError::Transport(_) => ErrorCode::TransportFailure,
            SessionError::Storage(_) => ErrorCode::StorageFailure,
        }
    }
}
