//! Real-time message synchronization for the active conversation.
//!
//! A [`Session`] is the scope of one open conversation. It owns the
//! [`MessageStore`], the [`PaginationCursor`], the
//! [`ConnectionManager`] and every timer tied to them, and exposes the
//! operations a UI drives: history loading, sending, retrying, deleting,
//! read receipts and typing. State changes are announced as [`SyncEvent`]s
//! and can be read at any time through [`Session::snapshot`].
//!
//! [`ChatSync`] holds at most one session and performs conversation
//! switches, tearing the previous scope down before building the next.

pub mod connection;
mod inbound;
pub mod pagination;
mod send;
pub mod store;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use whisper_proto::api::{ApiMessage, HistoryQuery};
use whisper_proto::message::{ChatUser, Conversation, ConversationId, Message, MessageId, MessageStatus, UserId};

use crate::api::{ApiError, ChatApi};
use crate::config::{ReconnectConfig, SyncConfig};
use crate::transport::Connector;

pub use connection::{ConnectionManager, ConnectionState, Inbound};
pub use pagination::PaginationCursor;
pub use send::SendError;
pub use store::{MessageStore, Reconciled};

use pagination::{Begin, Ticket};

/// Notifications emitted by a [`Session`] for UI refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The message list changed (insert, merge, removal, reorder).
    MessagesChanged {
        /// Conversation whose list changed.
        conversation_id: ConversationId,
    },
    /// A message's delivery status changed in place.
    StatusChanged {
        /// The message.
        message_id: MessageId,
        /// Its new status.
        status: MessageStatus,
    },
    /// The transport connection changed state.
    ConnectionChanged {
        /// New state.
        state: ConnectionState,
        /// Whether the session fell back to request/response only.
        degraded: bool,
    },
    /// The set of remote users currently typing changed.
    TypingChanged {
        /// Users typing, sorted by id.
        users: Vec<UserId>,
    },
    /// The set of users attached to the conversation changed.
    UsersChanged {
        /// Attached users.
        users: Vec<ChatUser>,
    },
    /// A history fetch started or finished.
    LoadingChanged {
        /// Whether a fetch is outstanding.
        loading: bool,
    },
    /// The error flag was set.
    Error {
        /// Human-readable reason.
        message: String,
    },
    /// A channel rejected the credential. The auth collaborator has been
    /// told; the UI should prompt for a new login.
    AuthenticationRequired,
}

/// Errors of history operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The request/response channel failed.
    #[error("request failed: {0}")]
    Api(#[from] ApiError),

    /// The request did not complete within its timeout.
    #[error("request timed out")]
    Timeout,

    /// The session was closed while the operation was running.
    #[error("session closed")]
    Closed,
}

/// What a history load did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was merged.
    Loaded {
        /// Messages in the page.
        count: usize,
    },
    /// Another fetch for this conversation is outstanding; nothing was sent.
    InFlight,
    /// The server has no older history; nothing was sent.
    Exhausted,
    /// The page arrived after a reset and was dropped.
    Stale,
}

/// Point-in-time view of a session for rendering.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    /// The conversation.
    pub conversation: Conversation,
    /// Messages, oldest first.
    pub messages: Vec<Message>,
    /// Whether a history fetch is outstanding.
    pub loading: bool,
    /// Last error, cleared by a successful reset.
    pub error: Option<String>,
    /// Whether older history may exist.
    pub has_more: bool,
    /// Whether the local user is flagged as typing.
    pub is_typing: bool,
    /// Remote users typing, sorted by id.
    pub typing_users: Vec<UserId>,
    /// Users attached to the conversation.
    pub connected_users: Vec<ChatUser>,
    /// Whether the transport session is open.
    pub transport_connected: bool,
    /// Transport lifecycle state.
    pub connection: ConnectionState,
    /// Whether the transport retry budget is spent.
    pub degraded: bool,
    /// Incoming messages not yet seen.
    pub unread_count: usize,
}

/// Changes applied while a reset was in flight, replayed over its page.
#[derive(Debug, Default)]
struct Replay {
    upserts: Vec<Message>,
    removals: Vec<MessageId>,
}

impl Replay {
    fn upsert(&mut self, message: &Message) {
        self.removals.retain(|id| *id != message.id);
        self.upserts.push(message.clone());
    }

    fn remove(&mut self, id: &MessageId) {
        self.upserts.retain(|m| m.id != *id);
        self.removals.push(id.clone());
    }
}

#[derive(Debug, Default)]
struct SessionState {
    store: MessageStore,
    cursor: PaginationCursor,
    error: Option<String>,
    typing_users: BTreeSet<UserId>,
    connected_users: Vec<ChatUser>,
    is_typing: bool,
    was_connected: bool,
    replay: Option<Replay>,
}

impl SessionState {
    fn record_upsert(&mut self, message: &Message) {
        if let Some(replay) = &mut self.replay {
            replay.upsert(message);
        }
    }

    fn record_removal(&mut self, id: &MessageId) {
        if let Some(replay) = &mut self.replay {
            replay.remove(id);
        }
    }
}

#[derive(Default)]
struct Tasks {
    applier: Option<JoinHandle<()>>,
    typing: Option<JoinHandle<()>>,
    resync: Option<JoinHandle<()>>,
    grace: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [self.applier.take(), self.typing.take(), self.resync.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        for task in self.grace.drain(..) {
            task.abort();
        }
    }
}

struct Inner<A: ChatApi, C: Connector> {
    conversation: Conversation,
    local_user: UserId,
    api: Arc<A>,
    connection: ConnectionManager<C>,
    config: SyncConfig,
    state: Mutex<SessionState>,
    tasks: Mutex<Tasks>,
    closed: AtomicBool,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl<A: ChatApi, C: Connector> Inner<A, C> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn emit(&self, event: SyncEvent) {
        if self.is_closed() {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            tracing::warn!(conversation = %self.conversation.id, ?event, "event channel full, dropping event");
        }
    }

    fn messages_changed(&self) {
        self.emit(SyncEvent::MessagesChanged {
            conversation_id: self.conversation.id.clone(),
        });
    }

    fn set_error(&self, message: String) {
        self.state.lock().error = Some(message.clone());
        self.emit(SyncEvent::Error { message });
    }

    /// Records a request/response failure and alerts the auth collaborator's
    /// listeners on 401.
    fn report_api_error(&self, error: &SyncError) {
        if matches!(error, SyncError::Api(ApiError::Unauthorized)) {
            self.emit(SyncEvent::AuthenticationRequired);
        }
        self.set_error(error.to_string());
    }

    fn to_messages(&self, page: Vec<ApiMessage>) -> Vec<Message> {
        page.into_iter()
            .map(|m| m.into_message(&self.local_user))
            .collect()
    }
}

impl<A: ChatApi, C: Connector> Drop for Inner<A, C> {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
        self.connection.abort();
    }
}

/// Releases the pagination slot if a fetch future is dropped mid-flight.
struct FetchGuard<'a> {
    state: &'a Mutex<SessionState>,
    ticket: Option<Ticket>,
}

impl FetchGuard<'_> {
    fn disarm(&mut self) {
        self.ticket = None;
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.state.lock().cursor.abandon(&ticket);
        }
    }
}

/// The synchronization scope of one open conversation.
pub struct Session<A: ChatApi, C: Connector> {
    inner: Arc<Inner<A, C>>,
}

impl<A: ChatApi, C: Connector> Clone for Session<A, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ChatApi, C: Connector> Session<A, C> {
    /// Opens `conversation`: attaches the transport and seeds the store from
    /// the newest history page, concurrently.
    ///
    /// A failed initial load only sets the error flag; the session is usable
    /// and `load_messages(true)` can be retried.
    pub async fn open(
        conversation: Conversation,
        local_user: UserId,
        api: Arc<A>,
        connector: C,
        config: SyncConfig,
        reconnect: ReconnectConfig,
        event_tx: mpsc::Sender<SyncEvent>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.event_buffer);
        let connection = ConnectionManager::new(connector, local_user.clone(), reconnect);
        let inner = Arc::new(Inner {
            conversation,
            local_user,
            api,
            connection,
            config,
            state: Mutex::new(SessionState::default()),
            tasks: Mutex::new(Tasks::default()),
            closed: AtomicBool::new(false),
            event_tx,
        });
        let applier = tokio::spawn(inbound::run(Arc::downgrade(&inner), inbound_rx));
        inner.tasks.lock().applier = Some(applier);

        let session = Self { inner };
        let conversation_id = session.inner.conversation.id.clone();
        tracing::info!(conversation = %conversation_id, "opening conversation");

        let ((), loaded) = tokio::join!(
            session.inner.connection.attach(&conversation_id, inbound_tx),
            session.load_messages(true),
        );
        if let Err(e) = loaded {
            tracing::warn!(conversation = %conversation_id, error = %e, "initial history load failed");
        }
        session
    }

    /// The conversation this session belongs to.
    #[must_use]
    pub fn conversation(&self) -> &Conversation {
        &self.inner.conversation
    }

    /// Loads history. With `reset`, fetches the newest page and replaces the
    /// store with it (provisional sends survive); otherwise behaves like
    /// [`load_more_messages`](Self::load_more_messages).
    ///
    /// # Errors
    ///
    /// [`SyncError::Api`] or [`SyncError::Timeout`] when the fetch fails (the
    /// store is left untouched and the error flag is set), and
    /// [`SyncError::Closed`] if the session closed meanwhile.
    pub async fn load_messages(&self, reset: bool) -> Result<LoadOutcome, SyncError> {
        if !reset {
            return self.load_more_messages().await;
        }
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SyncError::Closed);
        }

        let ticket = {
            let mut state = inner.state.lock();
            state.error = None;
            state.replay = Some(Replay::default());
            state.cursor.begin_reset()
        };
        let mut guard = FetchGuard {
            state: &inner.state,
            ticket: Some(ticket.clone()),
        };
        inner.emit(SyncEvent::LoadingChanged { loading: true });

        let query = HistoryQuery {
            limit: inner.config.page_size,
            before: None,
        };
        let result = self.fetch(&query).await;
        guard.disarm();
        if inner.is_closed() {
            return Err(SyncError::Closed);
        }

        match result {
            Ok(page) => {
                let page = inner.to_messages(page);
                let count = page.len();
                let (applied, loading) = {
                    let mut state = inner.state.lock();
                    let applied = state.cursor.finish_reset(&ticket, &page, inner.config.page_size);
                    if applied {
                        state.store.seed(page);
                        if let Some(replay) = state.replay.take() {
                            state.store.merge(replay.upserts);
                            for id in &replay.removals {
                                state.store.remove(id);
                            }
                        }
                    }
                    (applied, state.cursor.is_loading())
                };
                inner.emit(SyncEvent::LoadingChanged { loading });
                if !applied {
                    return Ok(LoadOutcome::Stale);
                }
                tracing::debug!(conversation = %inner.conversation.id, count, "history seeded");
                inner.messages_changed();
                Ok(LoadOutcome::Loaded { count })
            }
            Err(e) => {
                let loading = {
                    let mut state = inner.state.lock();
                    state.cursor.abandon(&ticket);
                    if !state.cursor.is_loading() {
                        state.replay = None;
                    }
                    state.cursor.is_loading()
                };
                inner.emit(SyncEvent::LoadingChanged { loading });
                tracing::warn!(conversation = %inner.conversation.id, error = %e, "history reset failed");
                inner.report_api_error(&e);
                Err(e)
            }
        }
    }

    /// Loads the page of history just older than the oldest loaded message.
    ///
    /// Single-flight: while any history fetch is outstanding this returns
    /// [`LoadOutcome::InFlight`] without a request, and once the server has
    /// returned a short page it returns [`LoadOutcome::Exhausted`].
    ///
    /// # Errors
    ///
    /// As for [`load_messages`](Self::load_messages).
    pub async fn load_more_messages(&self) -> Result<LoadOutcome, SyncError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SyncError::Closed);
        }

        let begin = {
            let mut state = inner.state.lock();
            let anchor = state.store.oldest().map(|m| m.id.clone());
            state.cursor.begin(anchor.as_ref())
        };
        let ticket = match begin {
            Begin::Go(ticket) => ticket,
            Begin::InFlight => return Ok(LoadOutcome::InFlight),
            Begin::Exhausted => return Ok(LoadOutcome::Exhausted),
        };
        let query = HistoryQuery {
            limit: inner.config.page_size,
            before: ticket.before.clone(),
        };
        let mut guard = FetchGuard {
            state: &inner.state,
            ticket: Some(ticket.clone()),
        };
        inner.emit(SyncEvent::LoadingChanged { loading: true });

        let result = self.fetch(&query).await;
        guard.disarm();
        if inner.is_closed() {
            return Err(SyncError::Closed);
        }

        match result {
            Ok(page) => {
                let page = inner.to_messages(page);
                let count = page.len();
                let (applied, loading) = {
                    let mut state = inner.state.lock();
                    let applied = state.cursor.finish(&ticket, &page, inner.config.page_size);
                    if applied {
                        state.store.merge(page);
                    }
                    (applied, state.cursor.is_loading())
                };
                inner.emit(SyncEvent::LoadingChanged { loading });
                if !applied {
                    tracing::debug!(conversation = %inner.conversation.id, "discarding page fetched before reset");
                    return Ok(LoadOutcome::Stale);
                }
                tracing::debug!(conversation = %inner.conversation.id, count, "older page merged");
                if count > 0 {
                    inner.messages_changed();
                }
                Ok(LoadOutcome::Loaded { count })
            }
            Err(e) => {
                let loading = {
                    let mut state = inner.state.lock();
                    state.cursor.abandon(&ticket);
                    state.cursor.is_loading()
                };
                inner.emit(SyncEvent::LoadingChanged { loading });
                tracing::warn!(conversation = %inner.conversation.id, error = %e, "older page failed");
                inner.report_api_error(&e);
                Err(e)
            }
        }
    }

    /// Brings the store up to date after a reconnect.
    ///
    /// Fetches the newest page and merges it, so older pages the user has
    /// scrolled back through stay in place. If the page shares nothing with
    /// the store and is full, more was missed than one page covers and the
    /// store is reset instead, leaving no gap.
    async fn catch_up(&self) -> Result<LoadOutcome, SyncError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SyncError::Closed);
        }
        let query = HistoryQuery {
            limit: inner.config.page_size,
            before: None,
        };
        let page = match self.fetch(&query).await {
            Ok(page) => inner.to_messages(page),
            Err(e) => {
                inner.report_api_error(&e);
                return Err(e);
            }
        };
        if inner.is_closed() {
            return Err(SyncError::Closed);
        }

        let count = page.len();
        let merged = {
            let mut state = inner.state.lock();
            let overlaps = page.iter().any(|m| state.store.get(&m.id).is_some());
            if overlaps || count < inner.config.page_size {
                for message in page {
                    match message.client_id.clone() {
                        Some(client_id) if state.store.get(&client_id).is_some() => {
                            state.store.replace_provisional(&client_id, message);
                        }
                        _ => state.store.merge([message]),
                    }
                }
                true
            } else {
                false
            }
        };
        if !merged {
            tracing::debug!(conversation = %inner.conversation.id, "gap since disconnect, resetting history");
            return self.load_messages(true).await;
        }
        tracing::debug!(conversation = %inner.conversation.id, count, "caught up after reconnect");
        inner.messages_changed();
        Ok(LoadOutcome::Loaded { count })
    }

    async fn fetch(&self, query: &HistoryQuery) -> Result<Vec<ApiMessage>, SyncError> {
        let inner = &self.inner;
        tokio::time::timeout(
            inner.config.history_timeout,
            inner.api.history(&inner.conversation.id, query),
        )
        .await
        .map_err(|_| SyncError::Timeout)?
        .map_err(SyncError::from)
    }

    /// Current observable state.
    #[must_use]
    pub fn snapshot(&self) -> SyncSnapshot {
        let inner = &self.inner;
        let state = inner.state.lock();
        SyncSnapshot {
            conversation: inner.conversation.clone(),
            messages: state.store.messages().to_vec(),
            loading: state.cursor.is_loading(),
            error: state.error.clone(),
            has_more: state.cursor.has_more(),
            is_typing: state.is_typing,
            typing_users: state.typing_users.iter().cloned().collect(),
            connected_users: state.connected_users.clone(),
            transport_connected: inner.connection.is_connected(),
            connection: inner.connection.state(),
            degraded: inner.connection.is_degraded(),
            unread_count: state.store.unread_count(&inner.local_user),
        }
    }

    /// Whether [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Tears the scope down: cancels timers and background tasks and
    /// detaches the transport. Results that resolve afterwards are dropped.
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.tasks.lock().abort_all();
        self.inner.connection.detach().await;
        tracing::info!(conversation = %self.inner.conversation.id, "session closed");
    }

    fn downgrade(&self) -> Weak<Inner<A, C>> {
        Arc::downgrade(&self.inner)
    }
}

/// Owner of the active conversation scope.
pub struct ChatSync<A: ChatApi, C: Connector + Clone> {
    api: Arc<A>,
    connector: C,
    local_user: UserId,
    config: SyncConfig,
    reconnect: ReconnectConfig,
    event_tx: mpsc::Sender<SyncEvent>,
    active: Option<Session<A, C>>,
}

impl<A: ChatApi, C: Connector + Clone> ChatSync<A, C> {
    /// Creates the owner and the channel its sessions report on.
    #[must_use]
    pub fn new(
        api: A,
        connector: C,
        local_user: UserId,
        config: SyncConfig,
        reconnect: ReconnectConfig,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        (
            Self {
                api: Arc::new(api),
                connector,
                local_user,
                config,
                reconnect,
                event_tx,
                active: None,
            },
            event_rx,
        )
    }

    /// Makes `conversation` the active one.
    ///
    /// Selecting the already active conversation returns its session
    /// unchanged; otherwise the previous session is closed first.
    pub async fn select(&mut self, conversation: Conversation) -> Session<A, C> {
        if let Some(active) = &self.active {
            if active.conversation().id == conversation.id {
                return active.clone();
            }
        }
        self.leave().await;
        let session = Session::open(
            conversation,
            self.local_user.clone(),
            Arc::clone(&self.api),
            self.connector.clone(),
            self.config.clone(),
            self.reconnect.clone(),
            self.event_tx.clone(),
        )
        .await;
        self.active = Some(session.clone());
        session
    }

    /// Closes the active session, if any.
    pub async fn leave(&mut self) {
        if let Some(session) = self.active.take() {
            session.close().await;
        }
    }

    /// The active session.
    #[must_use]
    pub const fn active(&self) -> Option<&Session<A, C>> {
        self.active.as_ref()
    }

    /// The local user's id.
    #[must_use]
    pub const fn local_user(&self) -> &UserId {
        &self.local_user
    }
}
