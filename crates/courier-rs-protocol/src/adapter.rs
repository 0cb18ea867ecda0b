use crate::Event;
use async_trait::async_trait;
use thiserror::Error;

/// Failure writing to a client connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client went away.
    #[error("client disconnected")]
    Disconnected,
    /// Underlying socket or stream failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Event could not be rendered in the negotiated format.
    #[error("encode error: {0}")]
    Encode(String),
}

/// Per-connection sink that renders events to a client.
///
/// Rendering into a concrete wire format (XML, JSON, script) is the
/// adapter's concern; the subscriber only decides what to push and when.
#[async_trait]
pub trait ClientAdapter: Send {
    /// Prepare the response channel.
    async fn start(&mut self) -> Result<(), TransportError>;

    /// Write one event to the client.
    async fn push(&mut self, event: &Event) -> Result<(), TransportError>;

    /// Finish the response.
    async fn stop(&mut self) -> Result<(), TransportError>;
}
