//! Outbound operations of a [`Session`]: send, retry, delete, read receipts
//! and typing.
//!
//! A send inserts a provisional `sending` entry, then races both channels:
//! a fire-and-forget `sendMessage` over the transport (when connected) and
//! an awaited request/response `send` bounded by `confirm_timeout`. The
//! server copy from the request/response channel replaces the provisional
//! entry. When that channel fails but the transport was connected, the
//! message is assumed delivered and shown as `sent` after
//! `soft_failure_grace`; nothing verifies that the transport frame was
//! actually persisted. Otherwise the entry becomes `failed` and can be
//! retried under the same id.

use whisper_proto::api::{MarkReadRequest, SendRequest};
use whisper_proto::event::ClientCommand;
use whisper_proto::message::{Message, MessageId, MessageStatus, ValidationError, validate_content};

use super::{Reconciled, Session, SyncEvent};
use crate::api::{ApiError, ChatApi};
use crate::transport::Connector;

/// Errors of outbound operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Content was rejected before anything was inserted.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No message with this id is in the store.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    /// Only `failed` messages can be retried.
    #[error("message {id} is {status}, only failed messages can be retried")]
    NotRetryable {
        /// The message.
        id: MessageId,
        /// Its current status.
        status: MessageStatus,
    },

    /// Both delete paths failed. The message stays removed locally; resync
    /// with `load_messages(true)` to restore server truth.
    #[error("failed to delete message {id}: {reason}")]
    DeleteFailed {
        /// The message.
        id: MessageId,
        /// Why the request/response delete failed.
        reason: String,
    },

    /// The session was closed.
    #[error("session closed")]
    Closed,
}

impl<A: ChatApi, C: Connector> Session<A, C> {
    /// Sends `content`, returning the provisional id it was inserted under.
    ///
    /// Resolves once the request/response channel has answered or timed
    /// out; the final status is visible in the store.
    ///
    /// # Errors
    ///
    /// [`SendError::Validation`] for blank or oversized content (nothing is
    /// inserted) and [`SendError::Closed`] after [`close`](Self::close).
    pub async fn send_message(&self, content: &str) -> Result<MessageId, SendError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SendError::Closed);
        }
        validate_content(content)?;

        let message = Message::provisional(
            inner.conversation.id.clone(),
            inner.local_user.clone(),
            content.to_string(),
        );
        let id = message.id.clone();
        inner.state.lock().store.merge([message]);
        inner.messages_changed();
        tracing::debug!(conversation = %inner.conversation.id, message_id = %id, "message queued");

        self.deliver(&id, content).await;
        Ok(id)
    }

    /// Re-sends a `failed` message under the same id and content.
    ///
    /// # Errors
    ///
    /// [`SendError::UnknownMessage`] if the id is not in the store,
    /// [`SendError::NotRetryable`] if it is not `failed`, and
    /// [`SendError::Closed`] after [`close`](Self::close).
    pub async fn retry_message(&self, id: &MessageId) -> Result<(), SendError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SendError::Closed);
        }
        let content = {
            let mut state = inner.state.lock();
            let message = state
                .store
                .get(id)
                .ok_or_else(|| SendError::UnknownMessage(id.clone()))?;
            if message.status != MessageStatus::Failed {
                return Err(SendError::NotRetryable {
                    id: id.clone(),
                    status: message.status,
                });
            }
            let content = message.content.clone();
            state.store.upsert_status(id, MessageStatus::Sending);
            content
        };
        inner.emit(SyncEvent::StatusChanged {
            message_id: id.clone(),
            status: MessageStatus::Sending,
        });
        tracing::debug!(conversation = %inner.conversation.id, message_id = %id, "retrying message");

        self.deliver(id, &content).await;
        Ok(())
    }

    /// Runs both channels for the provisional message `id` and settles its
    /// status.
    async fn deliver(&self, id: &MessageId, content: &str) {
        let inner = &self.inner;
        let conversation = &inner.conversation.id;
        let transport_connected = inner.connection.is_connected();

        let command = ClientCommand::SendMessage {
            conversation_id: conversation.clone(),
            content: content.to_string(),
            client_id: id.clone(),
        };
        let request = SendRequest {
            content: content.to_string(),
            client_id: Some(id.clone()),
        };
        let over_transport = async {
            if transport_connected {
                if let Err(e) = inner.connection.send(&command).await {
                    tracing::debug!(message_id = %id, error = %e, "transport send failed");
                }
            }
        };
        let over_api = tokio::time::timeout(
            inner.config.confirm_timeout,
            inner.api.send(conversation, &request),
        );
        let ((), outcome) = tokio::join!(over_transport, over_api);
        if inner.is_closed() {
            return;
        }

        let error = match outcome {
            Ok(Ok(server_copy)) => {
                let confirmed = server_copy.into_message(&inner.local_user);
                let server_id = confirmed.id.clone();
                let reconciled = {
                    let mut state = inner.state.lock();
                    let reconciled = state.store.replace_provisional(id, confirmed);
                    if reconciled != Reconciled::Missing {
                        if let Some(stored) = state.store.get(&server_id).cloned() {
                            state.record_upsert(&stored);
                        }
                    }
                    reconciled
                };
                if reconciled == Reconciled::Missing {
                    // Deleted locally while in flight: do not let it resurface.
                    tracing::debug!(message_id = %server_id, "message deleted during send, removing server copy");
                    if let Err(e) = inner.api.delete(conversation, &server_id).await {
                        tracing::debug!(message_id = %server_id, error = %e, "cleanup delete failed");
                    }
                } else {
                    tracing::debug!(message_id = %id, server_id = %server_id, "message confirmed");
                    inner.messages_changed();
                }
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => ApiError::Timeout,
        };

        if error == ApiError::Unauthorized {
            inner.emit(SyncEvent::AuthenticationRequired);
        }
        if transport_connected && error != ApiError::Unauthorized {
            tracing::warn!(message_id = %id, error = %error, "send unconfirmed, assuming delivery over transport");
            self.arm_grace_timer(id.clone());
        } else {
            tracing::warn!(message_id = %id, error = %error, "send failed");
            if inner.state.lock().store.upsert_status(id, MessageStatus::Failed) {
                inner.emit(SyncEvent::StatusChanged {
                    message_id: id.clone(),
                    status: MessageStatus::Failed,
                });
            }
        }
    }

    /// After the grace period, shows a still-unconfirmed message as `sent`.
    fn arm_grace_timer(&self, id: MessageId) {
        let weak = self.downgrade();
        let grace = self.inner.config.soft_failure_grace;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let promoted = {
                let mut state = inner.state.lock();
                let sending = state
                    .store
                    .get(&id)
                    .is_some_and(|m| m.status == MessageStatus::Sending);
                sending && state.store.upsert_status(&id, MessageStatus::Sent)
            };
            if promoted {
                inner.emit(SyncEvent::StatusChanged {
                    message_id: id,
                    status: MessageStatus::Sent,
                });
            }
        });
        let mut tasks = self.inner.tasks.lock();
        tasks.grace.retain(|t| !t.is_finished());
        tasks.grace.push(timer);
    }

    /// Deletes a message: removes it locally at once, then asks the server
    /// over the transport (when connected) and the request/response channel.
    ///
    /// Provisional messages never reached the server and are removed
    /// locally only. A request/response `404` counts as success.
    ///
    /// # Errors
    ///
    /// [`SendError::UnknownMessage`] if the id is not in the store,
    /// [`SendError::DeleteFailed`] when both channels failed (the entry is
    /// not restored), and [`SendError::Closed`] after
    /// [`close`](Self::close).
    pub async fn delete_message(&self, id: &MessageId) -> Result<(), SendError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SendError::Closed);
        }
        {
            let mut state = inner.state.lock();
            state
                .store
                .remove(id)
                .ok_or_else(|| SendError::UnknownMessage(id.clone()))?;
            state.record_removal(id);
        }
        inner.messages_changed();
        if id.is_provisional() {
            return Ok(());
        }

        let conversation = &inner.conversation.id;
        let over_transport = if inner.connection.is_connected() {
            let command = ClientCommand::DeleteMessage {
                conversation_id: conversation.clone(),
                message_id: id.clone(),
            };
            match inner.connection.send(&command).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(message_id = %id, error = %e, "transport delete failed");
                    false
                }
            }
        } else {
            false
        };

        let outcome = tokio::time::timeout(inner.config.confirm_timeout, inner.api.delete(conversation, id))
            .await
            .unwrap_or(Err(ApiError::Timeout));
        match outcome {
            Ok(()) | Err(ApiError::NotFound(_)) => Ok(()),
            Err(e) if over_transport => {
                tracing::debug!(message_id = %id, error = %e, "request delete failed, transport delete was sent");
                Ok(())
            }
            Err(e) => {
                if e == ApiError::Unauthorized {
                    inner.emit(SyncEvent::AuthenticationRequired);
                }
                tracing::warn!(message_id = %id, error = %e, "delete failed on both channels");
                inner.set_error(format!("failed to delete message: {e}"));
                Err(SendError::DeleteFailed {
                    id: id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Marks every incoming message as read and tells the server.
    ///
    /// Returns how many messages changed locally. Server synchronization is
    /// best effort: failures are logged and never surfaced.
    pub async fn mark_as_read(&self) -> usize {
        let inner = &self.inner;
        if inner.is_closed() {
            return 0;
        }
        let ids = inner.state.lock().store.mark_incoming_read(&inner.local_user);
        if ids.is_empty() {
            return 0;
        }
        inner.messages_changed();

        let conversation = &inner.conversation.id;
        if inner.connection.is_connected() {
            let command = ClientCommand::MarkAsRead {
                conversation_id: conversation.clone(),
                message_ids: ids.clone(),
            };
            if let Err(e) = inner.connection.send(&command).await {
                tracing::debug!(conversation = %conversation, error = %e, "transport read receipt failed");
            }
        }
        let count = ids.len();
        let request = MarkReadRequest { message_ids: ids };
        match tokio::time::timeout(inner.config.confirm_timeout, inner.api.mark_read(conversation, &request)).await {
            Ok(Ok(response)) => {
                tracing::debug!(conversation = %conversation, marked = response.marked_read, "read state synced");
            }
            Ok(Err(e)) => tracing::debug!(conversation = %conversation, error = %e, "read state sync failed"),
            Err(_) => tracing::debug!(conversation = %conversation, "read state sync timed out"),
        }
        count
    }

    /// Announces that the local user is typing and (re)arms the quiet timer
    /// that announces `stopTyping`. No-op without a transport session.
    pub async fn send_typing_status(&self) {
        let inner = &self.inner;
        if inner.is_closed() || !inner.connection.is_connected() {
            return;
        }
        let conversation = inner.conversation.id.clone();
        let command = ClientCommand::Typing {
            conversation_id: conversation.clone(),
        };
        if let Err(e) = inner.connection.send(&command).await {
            tracing::debug!(conversation = %conversation, error = %e, "typing notification failed");
            return;
        }
        inner.state.lock().is_typing = true;

        let weak = self.downgrade();
        let quiet = inner.config.typing_quiet;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.state.lock().is_typing = false;
            let command = ClientCommand::StopTyping {
                conversation_id: conversation.clone(),
            };
            if let Err(e) = inner.connection.send(&command).await {
                tracing::debug!(conversation = %conversation, error = %e, "stop-typing notification failed");
            }
        });
        if let Some(previous) = inner.tasks.lock().typing.replace(timer) {
            previous.abort();
        }
    }
}
