//! Real-time transport abstraction for Whisper.
//!
//! A [`Connector`] opens one [`Transport`] session per attached conversation.
//! Concrete implementations:
//! - [`websocket::WebSocketConnector`]: the backend's chat WebSocket
//! - [`loopback::LoopbackConnector`]: in-process link to a
//!   [`crate::sim::SimulatedServer`], used by tests and the offline demo

pub mod loopback;
pub mod websocket;

use std::future::Future;

use whisper_proto::codec::CodecError;
use whisper_proto::event::{ClientCommand, ServerEvent};
use whisper_proto::message::ConversationId;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The endpoint could not be reached.
    #[error("transport endpoint unreachable: {0}")]
    Unreachable(String),

    /// The server rejected the credential (close code 4001).
    #[error("transport rejected the credential")]
    Unauthorized,

    /// The local user is not a participant (close code 4003).
    #[error("not a participant of conversation {0}")]
    Forbidden(ConversationId),

    /// A frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether reconnecting could change the outcome.
    ///
    /// Credential and membership rejections are final until the external
    /// auth collaborator intervenes.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unauthorized | Self::Forbidden(_))
    }
}

/// A live, bidirectional push session bound to one conversation.
///
/// Sends are fire-and-forget: `Ok(())` means the command was handed to the
/// underlying connection, not that the server acted on it.
pub trait Transport: Send + Sync + 'static {
    /// Send a command to the server.
    fn send(
        &self,
        command: &ClientCommand,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next pushed event.
    ///
    /// Resolves with an error once the connection is gone; callers treat any
    /// error as a disconnect.
    fn recv(&self) -> impl Future<Output = Result<ServerEvent, TransportError>> + Send;

    /// Whether the underlying connection is currently open.
    fn is_connected(&self) -> bool;

    /// Close the connection. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens transport sessions.
pub trait Connector: Send + Sync + 'static {
    /// The session type produced by this connector.
    type Transport: Transport;

    /// Open and authenticate a session for `conversation`.
    ///
    /// The caller issues the `joinChat` declaration itself.
    fn connect(
        &self,
        conversation: &ConversationId,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}
