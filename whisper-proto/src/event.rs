//! Real-time transport frames.
//!
//! Both directions share one JSON shape, `{"event": <name>, "data": {...}}`,
//! with camelCase event names and snake_case payload fields.

use serde::{Deserialize, Serialize};

use crate::api::ApiMessage;
use crate::message::{ChatUser, ConversationId, MessageId, UserId};

/// Events pushed by the server to an attached client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A message was created in the conversation.
    NewMessage(ApiMessage),
    /// An existing message changed (content edit, read receipt).
    MessageUpdated(ApiMessage),
    /// A message was removed.
    MessageDeleted {
        /// Owning conversation.
        conversation_id: ConversationId,
        /// Removed message.
        message_id: MessageId,
    },
    /// A participant started typing.
    UserTyping {
        /// Conversation being typed in.
        conversation_id: ConversationId,
        /// Who is typing.
        user_id: UserId,
    },
    /// A participant stopped typing.
    UserStoppedTyping {
        /// Conversation being typed in.
        conversation_id: ConversationId,
        /// Who stopped.
        user_id: UserId,
    },
    /// Full list of users currently attached to the conversation.
    UsersInChat {
        /// Conversation the snapshot belongs to.
        conversation_id: ConversationId,
        /// Attached users.
        users: Vec<ChatUser>,
    },
    /// A user attached to the conversation.
    UserJoined {
        /// Conversation joined.
        conversation_id: ConversationId,
        /// The user.
        user: ChatUser,
    },
    /// A user detached from the conversation.
    UserLeft {
        /// Conversation left.
        conversation_id: ConversationId,
        /// The user.
        user_id: UserId,
    },
    /// The server rejected a command.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerEvent {
    /// Conversation this event belongs to, if it is conversation-scoped.
    #[must_use]
    pub const fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::NewMessage(msg) | Self::MessageUpdated(msg) => Some(&msg.conversation),
            Self::MessageDeleted {
                conversation_id, ..
            }
            | Self::UserTyping {
                conversation_id, ..
            }
            | Self::UserStoppedTyping {
                conversation_id, ..
            }
            | Self::UsersInChat {
                conversation_id, ..
            }
            | Self::UserJoined {
                conversation_id, ..
            }
            | Self::UserLeft {
                conversation_id, ..
            } => Some(conversation_id),
            Self::Error { .. } => None,
        }
    }
}

/// Commands a client sends over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Subscribe to a conversation's events.
    JoinChat {
        /// Conversation to join.
        conversation_id: ConversationId,
    },
    /// Deliver a message. The server echoes `client_id` on the resulting
    /// `newMessage` so the sender can reconcile its provisional entry.
    SendMessage {
        /// Target conversation.
        conversation_id: ConversationId,
        /// Text body.
        content: String,
        /// Provisional id the message was inserted under.
        client_id: MessageId,
    },
    /// Delete a message.
    DeleteMessage {
        /// Owning conversation.
        conversation_id: ConversationId,
        /// Message to delete.
        message_id: MessageId,
    },
    /// Acknowledge that messages were seen.
    MarkAsRead {
        /// Owning conversation.
        conversation_id: ConversationId,
        /// Messages seen.
        message_ids: Vec<MessageId>,
    },
    /// The local user is typing.
    Typing {
        /// Conversation being typed in.
        conversation_id: ConversationId,
    },
    /// The local user stopped typing.
    StopTyping {
        /// Conversation being typed in.
        conversation_id: ConversationId,
    },
}

impl ClientCommand {
    /// Conversation this command targets.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::JoinChat { conversation_id }
            | Self::SendMessage {
                conversation_id, ..
            }
            | Self::DeleteMessage {
                conversation_id, ..
            }
            | Self::MarkAsRead {
                conversation_id, ..
            }
            | Self::Typing { conversation_id }
            | Self::StopTyping { conversation_id } => conversation_id,
        }
    }
}
