//! Transport to a remote participant.
//!
//! A [Connection] carries requests in both directions over one websocket.
//! Outgoing requests are matched to their responses through correlation ids,
//! incoming requests are dispatched to a [RequestHandler].

mod connection;
mod pending;

pub use connection::{Connection, MAX_NUM_REQUESTS, PING_INTERVAL, PONG_TIMEOUT};

#[cfg(test)]
pub(crate) use connection::tests::{conn_pair, ws_pair};

use async_trait::async_trait;
use tracing::warn;

use crate::message::{CodecError, Message};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("timeout: {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("websocket: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },
    /// The remote answered with an `Error` message.
    #[error("{0}")]
    Remote(String),
}

impl ConnectionError {
    /// Map a response that is neither the expected message nor an `Error`.
    pub fn unexpected(expected: &'static str, got: Message) -> Self {
        match got {
            Message::Error(e) => ConnectionError::Remote(e.error),
            other => ConnectionError::UnexpectedResponse {
                expected,
                got: other.kind(),
            },
        }
    }
}

/// Receives the requests of the remote participant.
///
/// The returned message is sent back as the response to the request.
/// Notifications are handled in the order they arrive.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, msg: Message) -> Message;

    /// A message sent outside of a request, such as `ChannelCreated`.
    async fn handle_notification(&self, msg: Message) {
        warn!(kind = msg.kind(), "ignoring message outside of a request");
    }
}
