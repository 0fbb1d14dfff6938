//! Client side of the streamed completion exchange.
//!
//! A [`Transport`] turns the full message list into one [`DeltaStream`]:
//! finite, not restartable, read by a single consumer. Opening a new stream
//! through the same transport cancels the previous one.

pub mod frame;
pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::chat::types::{Message, Part};

pub use frame::{encode_frame, Frame, FrameDecoder};
pub use http::HttpTransport;

/// One incremental unit of the assistant reply.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    PartAppended(Part),
    PartialTextExtended(String),
    StreamEnded,
    StreamFailed(TransportError),
}

impl StreamDelta {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamDelta::StreamEnded | StreamDelta::StreamFailed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("The response stream ended before the reply was complete")]
    StreamAborted,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Posts `messages` and returns the reply stream. Any stream previously
    /// opened through this transport is cancelled first.
    async fn submit(&self, messages: &[Message]) -> Result<Box<dyn DeltaStream>, TransportError>;
}

#[async_trait]
pub trait DeltaStream: Send {
    /// Next delta in server order; `None` once a terminal delta has been
    /// returned or the stream was cancelled.
    async fn next_delta(&mut self) -> Option<StreamDelta>;

    /// Assistant message id announced by the server, once seen.
    fn message_id(&self) -> Option<&str>;

    /// Closes the underlying connection. Idempotent.
    fn cancel(&mut self);
}
