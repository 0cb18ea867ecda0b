//! Error types for the core dispatch crate.

use courier_rs_protocol::ProtocolError;
use courier_rs_store::StoreError;
use thiserror::Error;

/// Errors returned by registry, queue, and routing operations.
#[derive(Debug, Error)]
pub enum CourierError {
    /// Subject list was empty or contained only separators.
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    /// Shared store call failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// A stored value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// A stored protocol value is malformed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The owning connection shut down while waiting.
    #[error("wait cancelled")]
    Cancelled,
}
