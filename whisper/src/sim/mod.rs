//! In-process chat backend.
//!
//! [`SimulatedServer`] implements both channels the sync core talks to:
//! [`SimulatedApi`] for request/response and
//! [`LoopbackConnector`](crate::transport::loopback::LoopbackConnector) for
//! push. It keeps messages per conversation, assigns server ids and
//! timestamps, fans events out to attached links, and exposes fault knobs
//! and call counters so tests can drive every failure path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use whisper_proto::api::{
    ApiMessage, ApiUser, HistoryQuery, MarkReadRequest, MarkReadResponse, SendRequest,
};
use whisper_proto::event::{ClientCommand, ServerEvent};
use whisper_proto::message::{ChatUser, ConversationId, MessageId, Timestamp, UserId};

use crate::api::{ApiError, ChatApi};
use crate::transport::TransportError;
use crate::transport::loopback::LoopbackConnector;

/// Capacity of each link's event queue. Events beyond it are dropped.
const LINK_BUFFER: usize = 256;

/// Failure modes that can be switched on at runtime.
#[derive(Debug, Default)]
struct Faults {
    fail_sends: bool,
    failing_sends: usize,
    fail_deletes: bool,
    fail_history: bool,
    refuse_connections: bool,
    deny_access: bool,
    ignore_transport_sends: bool,
    response_delay: Duration,
}

/// An attached transport session.
struct Link {
    id: u64,
    user: ChatUser,
    conversation: ConversationId,
    tx: mpsc::Sender<ServerEvent>,
}

#[derive(Default)]
struct ServerState {
    conversations: HashMap<ConversationId, Vec<ApiMessage>>,
    links: Vec<Link>,
    next_message: u64,
    next_link: u64,
    last_timestamp_ms: i64,
    faults: Faults,
    commands: Vec<ClientCommand>,
}

impl ServerState {
    /// Allocates the next server timestamp, strictly after the previous one.
    fn stamp(&mut self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        self.last_timestamp_ms = now.max(self.last_timestamp_ms + 1);
        Timestamp::from_millis(self.last_timestamp_ms)
    }

    /// Stores a message, or returns the one already stored under the same
    /// `client_id`. The flag is `true` when a new message was created.
    fn persist(
        &mut self,
        conversation: &ConversationId,
        sender: &ChatUser,
        content: String,
        client_id: Option<MessageId>,
    ) -> (ApiMessage, bool) {
        if let Some(existing) = client_id.as_ref().and_then(|cid| {
            self.conversations
                .get(conversation)?
                .iter()
                .find(|m| m.client_id.as_ref() == Some(cid))
        }) {
            return (existing.clone(), false);
        }

        self.next_message += 1;
        let message = ApiMessage {
            id: MessageId::new(format!("srv{}", self.next_message)),
            conversation: conversation.clone(),
            sender: ApiUser {
                id: sender.id.clone(),
                username: Some(sender.username.clone()),
            },
            content,
            timestamp: self.stamp(),
            is_read: false,
            client_id,
        };
        self.conversations
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());
        (message, true)
    }

    fn broadcast(&self, conversation: &ConversationId, event: &ServerEvent, except: Option<u64>) {
        for link in self
            .links
            .iter()
            .filter(|l| l.conversation == *conversation && Some(l.id) != except)
        {
            if link.tx.try_send(event.clone()).is_err() {
                tracing::debug!(link = link.id, "simulated link queue full, event dropped");
            }
        }
    }

    fn users_in(&self, conversation: &ConversationId) -> Vec<ChatUser> {
        let mut users: Vec<ChatUser> = Vec::new();
        for link in self.links.iter().filter(|l| l.conversation == *conversation) {
            if !users.iter().any(|u| u.id == link.user.id) {
                users.push(link.user.clone());
            }
        }
        users
    }

    fn remove_message(&mut self, conversation: &ConversationId, id: &MessageId) -> Option<ApiMessage> {
        let messages = self.conversations.get_mut(conversation)?;
        let pos = messages.iter().position(|m| m.id == *id)?;
        Some(messages.remove(pos))
    }

    /// Flags unread messages not authored by `reader` as read, returning the
    /// updated copies.
    fn mark_read(
        &mut self,
        conversation: &ConversationId,
        reader: &UserId,
        ids: &[MessageId],
    ) -> Vec<ApiMessage> {
        let Some(messages) = self.conversations.get_mut(conversation) else {
            return Vec::new();
        };
        messages
            .iter_mut()
            .filter(|m| !m.is_read && m.sender.id != *reader && ids.contains(&m.id))
            .map(|m| {
                m.is_read = true;
                m.clone()
            })
            .collect()
    }
}

/// In-process implementation of the chat backend.
#[derive(Default)]
pub struct SimulatedServer {
    state: Mutex<ServerState>,
    history_calls: AtomicUsize,
    send_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    mark_read_calls: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl SimulatedServer {
    /// Creates an empty server.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a server holding a short back-and-forth between `local` and a
    /// demo peer in `conversation`, long enough to page through.
    #[must_use]
    pub fn with_demo_data(local: &ChatUser, conversation: &ConversationId) -> Arc<Self> {
        let server = Self::new();
        let peer = ChatUser {
            id: UserId::new("demo-peer"),
            username: "bob".to_string(),
        };
        for i in 1..=45 {
            let (author, text) = if i % 3 == 0 {
                (local, format!("reply #{i}"))
            } else {
                (&peer, format!("message #{i} from bob"))
            };
            server.insert_message(conversation, author, text);
        }
        server
    }

    /// A request/response client acting as `user`.
    #[must_use]
    pub fn api(self: &Arc<Self>, user: ChatUser) -> SimulatedApi {
        SimulatedApi {
            server: Arc::clone(self),
            user,
        }
    }

    /// A transport connector acting as `user`.
    #[must_use]
    pub fn connector(self: &Arc<Self>, user: ChatUser) -> LoopbackConnector {
        LoopbackConnector::new(Arc::clone(self), user)
    }

    // -- Seeding and inspection --

    /// Stores a message without notifying anyone, as history.
    pub fn insert_message(
        &self,
        conversation: &ConversationId,
        sender: &ChatUser,
        content: impl Into<String>,
    ) -> ApiMessage {
        self.state
            .lock()
            .persist(conversation, sender, content.into(), None)
            .0
    }

    /// Stores a message and pushes `newMessage` to every attached link, as if
    /// `sender` had posted it from another client.
    pub fn post_message(
        &self,
        conversation: &ConversationId,
        sender: &ChatUser,
        content: impl Into<String>,
    ) -> ApiMessage {
        let mut state = self.state.lock();
        let (message, _) = state.persist(conversation, sender, content.into(), None);
        state.broadcast(conversation, &ServerEvent::NewMessage(message.clone()), None);
        message
    }

    /// Pushes an arbitrary event to every link attached to `conversation`.
    pub fn push(&self, conversation: &ConversationId, event: &ServerEvent) {
        self.state.lock().broadcast(conversation, event, None);
    }

    /// Messages stored for `conversation`, oldest first.
    #[must_use]
    pub fn messages(&self, conversation: &ConversationId) -> Vec<ApiMessage> {
        self.state
            .lock()
            .conversations
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// Every command received over the transport, in arrival order.
    #[must_use]
    pub fn received_commands(&self) -> Vec<ClientCommand> {
        self.state.lock().commands.clone()
    }

    /// Number of links currently attached to `conversation`.
    #[must_use]
    pub fn attached(&self, conversation: &ConversationId) -> usize {
        self.state
            .lock()
            .links
            .iter()
            .filter(|l| l.conversation == *conversation)
            .count()
    }

    /// Number of history requests served or refused.
    #[must_use]
    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::Relaxed)
    }

    /// Number of send requests received.
    #[must_use]
    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::Relaxed)
    }

    /// Number of delete requests received.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::Relaxed)
    }

    /// Number of mark-read requests received.
    #[must_use]
    pub fn mark_read_calls(&self) -> usize {
        self.mark_read_calls.load(Ordering::Relaxed)
    }

    /// Number of transport connection attempts, refused ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    // -- Fault injection --

    /// Make every send request fail until switched off.
    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().faults.fail_sends = fail;
    }

    /// Make the next `n` send requests fail.
    pub fn fail_next_sends(&self, n: usize) {
        self.state.lock().faults.failing_sends = n;
    }

    /// Make delete requests fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().faults.fail_deletes = fail;
    }

    /// Make history requests fail.
    pub fn fail_history(&self, fail: bool) {
        self.state.lock().faults.fail_history = fail;
    }

    /// Refuse new transport connections as unreachable.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().faults.refuse_connections = refuse;
    }

    /// Reject new transport connections as not-a-participant.
    pub fn deny_access(&self, deny: bool) {
        self.state.lock().faults.deny_access = deny;
    }

    /// Accept transport commands but act on none of them.
    pub fn ignore_transport_sends(&self, ignore: bool) {
        self.state.lock().faults.ignore_transport_sends = ignore;
    }

    /// Delay every request/response call by `delay`.
    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().faults.response_delay = delay;
    }

    /// Sever every attached link, as a server restart would.
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut self.state.lock().links);
        tracing::debug!(count = dropped.len(), "simulated server dropped all links");
    }

    // -- Link plumbing used by the loopback transport --

    pub(crate) fn open_link(
        &self,
        user: &ChatUser,
        conversation: &ConversationId,
    ) -> Result<(u64, mpsc::Receiver<ServerEvent>), TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.faults.refuse_connections {
            return Err(TransportError::Unreachable(
                "simulated server refused the connection".to_string(),
            ));
        }
        if state.faults.deny_access {
            return Err(TransportError::Forbidden(conversation.clone()));
        }
        state.next_link += 1;
        let id = state.next_link;
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        state.links.push(Link {
            id,
            user: user.clone(),
            conversation: conversation.clone(),
            tx,
        });
        Ok((id, rx))
    }

    pub(crate) fn has_link(&self, link_id: u64) -> bool {
        self.state.lock().links.iter().any(|l| l.id == link_id)
    }

    pub(crate) fn close_link(&self, link_id: u64) {
        let mut state = self.state.lock();
        let Some(pos) = state.links.iter().position(|l| l.id == link_id) else {
            return;
        };
        let link = state.links.remove(pos);
        let users = state.users_in(&link.conversation);
        state.broadcast(
            &link.conversation,
            &ServerEvent::UserLeft {
                conversation_id: link.conversation.clone(),
                user_id: link.user.id.clone(),
            },
            None,
        );
        state.broadcast(
            &link.conversation,
            &ServerEvent::UsersInChat {
                conversation_id: link.conversation.clone(),
                users,
            },
            None,
        );
    }

    pub(crate) fn handle_command(&self, link_id: u64, command: ClientCommand) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let Some(link) = state.links.iter().find(|l| l.id == link_id) else {
            return Err(TransportError::ConnectionClosed);
        };
        let user = link.user.clone();
        let conversation = link.conversation.clone();
        let reply = link.tx.clone();

        state.commands.push(command.clone());
        if state.faults.ignore_transport_sends {
            return Ok(());
        }
        if *command.conversation_id() != conversation {
            let _ = reply.try_send(ServerEvent::Error {
                message: format!("not attached to conversation {}", command.conversation_id()),
            });
            return Ok(());
        }

        match command {
            ClientCommand::JoinChat { .. } => {
                state.broadcast(
                    &conversation,
                    &ServerEvent::UserJoined {
                        conversation_id: conversation.clone(),
                        user: user.clone(),
                    },
                    Some(link_id),
                );
                let users = state.users_in(&conversation);
                state.broadcast(
                    &conversation,
                    &ServerEvent::UsersInChat {
                        conversation_id: conversation.clone(),
                        users,
                    },
                    None,
                );
            }
            ClientCommand::SendMessage {
                content, client_id, ..
            } => {
                let (message, _) = state.persist(&conversation, &user, content, Some(client_id));
                state.broadcast(&conversation, &ServerEvent::NewMessage(message), None);
            }
            ClientCommand::DeleteMessage { message_id, .. } => {
                let owned = state
                    .conversations
                    .get(&conversation)
                    .and_then(|ms| ms.iter().find(|m| m.id == message_id))
                    .map(|m| m.sender.id == user.id);
                match owned {
                    Some(true) => {
                        state.remove_message(&conversation, &message_id);
                        state.broadcast(
                            &conversation,
                            &ServerEvent::MessageDeleted {
                                conversation_id: conversation.clone(),
                                message_id,
                            },
                            None,
                        );
                    }
                    Some(false) => {
                        let _ = reply.try_send(ServerEvent::Error {
                            message: "cannot delete another user's message".to_string(),
                        });
                    }
                    None => {}
                }
            }
            ClientCommand::MarkAsRead { message_ids, .. } => {
                for updated in state.mark_read(&conversation, &user.id, &message_ids) {
                    state.broadcast(&conversation, &ServerEvent::MessageUpdated(updated), None);
                }
            }
            ClientCommand::Typing { .. } => {
                state.broadcast(
                    &conversation,
                    &ServerEvent::UserTyping {
                        conversation_id: conversation.clone(),
                        user_id: user.id,
                    },
                    Some(link_id),
                );
            }
            ClientCommand::StopTyping { .. } => {
                state.broadcast(
                    &conversation,
                    &ServerEvent::UserStoppedTyping {
                        conversation_id: conversation.clone(),
                        user_id: user.id,
                    },
                    Some(link_id),
                );
            }
        }
        Ok(())
    }

    async fn delay(&self) {
        let delay = self.state.lock().faults.response_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Request/response client bound to a [`SimulatedServer`] and a user.
#[derive(Clone)]
pub struct SimulatedApi {
    server: Arc<SimulatedServer>,
    user: ChatUser,
}

impl ChatApi for SimulatedApi {
    async fn history(
        &self,
        conversation: &ConversationId,
        query: &HistoryQuery,
    ) -> Result<Vec<ApiMessage>, ApiError> {
        self.server.history_calls.fetch_add(1, Ordering::Relaxed);
        self.server.delay().await;

        let state = self.server.state.lock();
        if state.faults.fail_history {
            return Err(ApiError::Status {
                status: 500,
                body: "simulated history failure".to_string(),
            });
        }
        let messages = state
            .conversations
            .get(conversation)
            .map_or(&[][..], Vec::as_slice);
        let end = match &query.before {
            Some(before) => messages
                .iter()
                .position(|m| m.id == *before)
                .ok_or_else(|| ApiError::NotFound(format!("message {before}")))?,
            None => messages.len(),
        };
        let start = end.saturating_sub(query.limit);
        Ok(messages[start..end].to_vec())
    }

    async fn send(
        &self,
        conversation: &ConversationId,
        request: &SendRequest,
    ) -> Result<ApiMessage, ApiError> {
        self.server.send_calls.fetch_add(1, Ordering::Relaxed);
        self.server.delay().await;

        let mut state = self.server.state.lock();
        if state.faults.fail_sends || state.faults.failing_sends > 0 {
            state.faults.failing_sends = state.faults.failing_sends.saturating_sub(1);
            return Err(ApiError::Status {
                status: 503,
                body: "simulated send failure".to_string(),
            });
        }
        let (message, created) = state.persist(
            conversation,
            &self.user,
            request.content.clone(),
            request.client_id.clone(),
        );
        if created {
            state.broadcast(conversation, &ServerEvent::NewMessage(message.clone()), None);
        }
        Ok(message)
    }

    async fn delete(&self, conversation: &ConversationId, message: &MessageId) -> Result<(), ApiError> {
        self.server.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.server.delay().await;

        let mut state = self.server.state.lock();
        if state.faults.fail_deletes {
            return Err(ApiError::Status {
                status: 500,
                body: "simulated delete failure".to_string(),
            });
        }
        state
            .remove_message(conversation, message)
            .ok_or_else(|| ApiError::NotFound(format!("message {message}")))?;
        state.broadcast(
            conversation,
            &ServerEvent::MessageDeleted {
                conversation_id: conversation.clone(),
                message_id: message.clone(),
            },
            None,
        );
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        request: &MarkReadRequest,
    ) -> Result<MarkReadResponse, ApiError> {
        self.server.mark_read_calls.fetch_add(1, Ordering::Relaxed);
        self.server.delay().await;

        let mut state = self.server.state.lock();
        let updated = state.mark_read(conversation, &self.user.id, &request.message_ids);
        for message in &updated {
            state.broadcast(conversation, &ServerEvent::MessageUpdated(message.clone()), None);
        }
        Ok(MarkReadResponse {
            marked_read: updated.len(),
        })
    }
}
