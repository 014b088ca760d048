//! Core data model shared by every channel of the Whisper client.
//!
//! A [`Message`] is identified either by a client-generated provisional id
//! (assigned when the user hits send) or by the server id it receives once
//! confirmed. Identifiers coming from the backend may be JSON strings or
//! integers, so every id newtype accepts both on deserialization and always
//! serializes as a string.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_CONTENT_LEN: usize = 64 * 1024;

/// Prefix carried by every provisional message id.
pub const PROVISIONAL_PREFIX: &str = "local-";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the string form of this identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserialize_flexible_id(deserializer).map(Self)
            }
        }
    };
}

string_id!(
    /// Identifies a message within a conversation.
    ///
    /// Provisional ids start with [`PROVISIONAL_PREFIX`]; everything else is a
    /// server-assigned id.
    MessageId
);

string_id!(
    /// Identifies a user account on the backend.
    UserId
);

string_id!(
    /// Identifies a private or group conversation.
    ConversationId
);

impl MessageId {
    /// Generates a fresh provisional id (`local-<uuid v7>`).
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", Uuid::now_v7()))
    }

    /// Whether this id was generated client-side and not yet confirmed.
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }
}

/// Accepts either a JSON string or an integer and returns its string form.
fn deserialize_flexible_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Unsigned(n) => n.to_string(),
        RawId::Signed(n) => n.to_string(),
    })
}

/// UTC instant a message was created.
///
/// Serialized as RFC 3339, which is what the backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// The current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Builds a timestamp from milliseconds since the Unix epoch.
    ///
    /// Out-of-range values clamp to the epoch.
    #[must_use]
    pub fn from_millis(ms: i64) -> Self {
        Self(Utc.timestamp_millis_opt(ms).single().unwrap_or_default())
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The underlying `chrono` value.
    #[must_use]
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Delivery status of a message.
///
/// Outbound messages move `Sending -> Sent -> Delivered -> Read`, or
/// `Sending -> Failed` when every delivery path is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Optimistically inserted, confirmation outstanding.
    Sending,
    /// Accepted by the server.
    Sent,
    /// Reached the recipient.
    Delivered,
    /// Seen by the recipient.
    Read,
    /// Both delivery paths failed; eligible for retry.
    Failed,
}

impl MessageStatus {
    /// Progress rank used when two copies of a message disagree.
    ///
    /// `Failed` ranks lowest so that any later evidence of delivery wins.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Failed => 0,
            Self::Sending => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
            Self::Read => 4,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Author of a message as far as the client knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Account id, compared against the local user to classify own/other.
    pub id: UserId,
    /// Display name, when the backend supplied one.
    pub username: Option<String>,
}

impl Sender {
    /// A sender known only by id.
    #[must_use]
    pub const fn id_only(id: UserId) -> Self {
        Self { id, username: None }
    }
}

/// A chat message held by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Provisional or server id.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Text body. May be empty when attachments are present.
    pub content: String,
    /// Author.
    pub sender: Sender,
    /// Creation instant (client clock while provisional).
    pub timestamp: Timestamp,
    /// Delivery status.
    pub status: MessageStatus,
    /// Whether the recipient has seen this message.
    pub read: bool,
    /// Provisional id this message was sent under, when the server echoed one.
    pub client_id: Option<MessageId>,
}

impl Message {
    /// Builds an optimistic outbound message with a fresh provisional id.
    #[must_use]
    pub fn provisional(conversation_id: ConversationId, sender: UserId, content: String) -> Self {
        Self {
            id: MessageId::provisional(),
            conversation_id,
            content,
            sender: Sender::id_only(sender),
            timestamp: Timestamp::now(),
            status: MessageStatus::Sending,
            read: false,
            client_id: None,
        }
    }

    /// Whether `user` authored this message.
    #[must_use]
    pub fn is_from(&self, user: &UserId) -> bool {
        self.sender.id == *user
    }
}

/// Errors produced by [`validate_content`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Content was empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Content exceeds [`MAX_CONTENT_LEN`].
    #[error("message content too large: {size} bytes (max {max} bytes)")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Checks that outbound text content is sendable.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank content and
/// [`ValidationError::TooLarge`] when it exceeds [`MAX_CONTENT_LEN`].
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if content.len() > MAX_CONTENT_LEN {
        return Err(ValidationError::TooLarge {
            size: content.len(),
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(())
}

/// A member currently present in a chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatUser {
    /// Account id.
    pub id: UserId,
    /// Display name.
    #[serde(default)]
    pub username: String,
}

/// Whether a conversation is one-to-one or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Direct message between two users.
    Private,
    /// More than two participants.
    Group,
}

/// A conversation the client can open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id.
    pub id: ConversationId,
    /// Optional display name (groups usually have one).
    pub name: Option<String>,
    /// Private or group.
    pub kind: ConversationKind,
    /// Participating users.
    pub participants: Vec<UserId>,
}

impl Conversation {
    /// Builds a conversation, classifying it as a group when it has more
    /// than two participants.
    #[must_use]
    pub fn new(id: ConversationId, participants: Vec<UserId>) -> Self {
        let kind = if participants.len() > 2 {
            ConversationKind::Group
        } else {
            ConversationKind::Private
        };
        Self {
            id,
            name: None,
            kind,
            participants,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
