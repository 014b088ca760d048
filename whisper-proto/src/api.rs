//! Request/response payloads of the REST channel.
//!
//! Field names follow the backend's serializers (`is_read`, nested `sender`).

use serde::{Deserialize, Serialize};

use crate::message::{
    ConversationId, Message, MessageId, MessageStatus, Sender, Timestamp, UserId,
};

/// A user as embedded in a message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUser {
    /// Account id.
    pub id: UserId,
    /// Login name.
    #[serde(default)]
    pub username: Option<String>,
}

/// A message as the server represents it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMessage {
    /// Server id.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation: ConversationId,
    /// Author.
    pub sender: ApiUser,
    /// Text body.
    #[serde(default)]
    pub content: String,
    /// Server-assigned creation instant.
    pub timestamp: Timestamp,
    /// Whether the recipient has seen it.
    #[serde(default)]
    pub is_read: bool,
    /// Provisional id echoed back for messages sent over the transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<MessageId>,
}

impl ApiMessage {
    /// Converts into the client model, deriving `status` from the point of
    /// view of `local_user`.
    ///
    /// Own messages are `sent` until the peer has read them; incoming
    /// messages are `delivered` by definition.
    #[must_use]
    pub fn into_message(self, local_user: &UserId) -> Message {
        let own = self.sender.id == *local_user;
        let status = match (own, self.is_read) {
            (true, true) => MessageStatus::Read,
            (true, false) => MessageStatus::Sent,
            (false, _) => MessageStatus::Delivered,
        };
        Message {
            id: self.id,
            conversation_id: self.conversation,
            content: self.content,
            sender: Sender {
                id: self.sender.id,
                username: self.sender.username,
            },
            timestamp: self.timestamp,
            status,
            read: self.is_read,
            client_id: self.client_id,
        }
    }
}

/// Query of a history page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Maximum number of messages to return.
    pub limit: usize,
    /// Only return messages strictly older than this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<MessageId>,
}

/// Body of a send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Text body.
    pub content: String,
    /// Provisional id of the message, used by the server as an idempotency
    /// key so the same message sent over both channels is stored once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<MessageId>,
}

/// Body of a mark-read request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadRequest {
    /// Messages the local user has seen.
    pub message_ids: Vec<MessageId>,
}

/// Response to a mark-read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadResponse {
    /// Number of messages whose read flag changed.
    pub marked_read: usize,
}
