//! Request/response channel to the chat backend.
//!
//! [`ChatApi`] is the seam the sync core talks through; [`http::HttpApi`]
//! is the production implementation and [`crate::sim::SimulatedApi`] the
//! in-process one.

pub mod http;

use std::future::Future;

use whisper_proto::api::{ApiMessage, HistoryQuery, MarkReadRequest, MarkReadResponse, SendRequest};
use whisper_proto::message::{ConversationId, MessageId};

/// Errors returned by the request/response channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The credential was rejected (HTTP 401). Never retried locally.
    #[error("request rejected: unauthorized")]
    Unauthorized,

    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-success status.
    #[error("server returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The request could not be delivered.
    #[error("network error: {0}")]
    Network(String),

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Backend operations used by the sync core.
///
/// History pages are returned in ascending timestamp order and contain only
/// messages strictly older than `query.before` when it is set.
pub trait ChatApi: Send + Sync + 'static {
    /// Fetch one page of history.
    fn history(
        &self,
        conversation: &ConversationId,
        query: &HistoryQuery,
    ) -> impl Future<Output = Result<Vec<ApiMessage>, ApiError>> + Send;

    /// Persist a new message and return the server's copy.
    fn send(
        &self,
        conversation: &ConversationId,
        request: &SendRequest,
    ) -> impl Future<Output = Result<ApiMessage, ApiError>> + Send;

    /// Delete a message.
    fn delete(
        &self,
        conversation: &ConversationId,
        message: &MessageId,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Mark messages as read by the local user.
    fn mark_read(
        &self,
        conversation: &ConversationId,
        request: &MarkReadRequest,
    ) -> impl Future<Output = Result<MarkReadResponse, ApiError>> + Send;
}
