//! Connection manager: one transport session per active conversation.
//!
//! [`ConnectionManager::attach`] spawns a supervisor task that connects with
//! a bounded number of attempts and a fixed backoff, declares `joinChat`, and
//! forwards pushed events as [`Inbound`] messages. `attach` returns once the
//! first attempt settles; later attempts run in the background. When the
//! session drops, the supervisor reconnects within the same budget; once it
//! is spent the connection is marked degraded and the session keeps working
//! over request/response only.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use whisper_proto::event::{ClientCommand, ServerEvent};
use whisper_proto::message::{ConversationId, UserId};

use crate::config::ReconnectConfig;
use crate::transport::{Connector, Transport, TransportError};

/// Lifecycle of the transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Session open and `joinChat` declared.
    Connected,
}

/// What the connection manager reports to its session.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A pushed event for the attached conversation.
    Event(ServerEvent),
    /// The connection changed state.
    State {
        /// New state.
        state: ConnectionState,
        /// Whether the retry budget is spent.
        degraded: bool,
    },
    /// The server refused the session for good (credential or membership).
    Refused(Arc<TransportError>),
}

struct Link<T> {
    conversation: Option<ConversationId>,
    transport: Option<Arc<T>>,
    state: ConnectionState,
    degraded: bool,
    supervisor: Option<JoinHandle<()>>,
    generation: u64,
}

struct Shared<C: Connector> {
    connector: C,
    local_user: UserId,
    reconnect: ReconnectConfig,
    link: Mutex<Link<C::Transport>>,
}

/// Owns the transport session of one conversation scope.
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a detached manager.
    #[must_use]
    pub fn new(connector: C, local_user: UserId, reconnect: ReconnectConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                local_user,
                reconnect,
                link: Mutex::new(Link {
                    conversation: None,
                    transport: None,
                    state: ConnectionState::Disconnected,
                    degraded: false,
                    supervisor: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Attaches to `conversation`, forwarding its events to `inbound`.
    ///
    /// Resolves once the first connection attempt settles: connected,
    /// refused, or failed with retries scheduled in the background. No error
    /// is returned. Attaching again to the same conversation is a no-op;
    /// attaching to another one detaches first.
    pub async fn attach(&self, conversation: &ConversationId, inbound: mpsc::Sender<Inbound>) {
        let current = self.shared.link.lock().conversation.clone();
        match current {
            Some(ref attached) if attached == conversation => return,
            Some(_) => self.detach().await,
            None => {}
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut link = self.shared.link.lock();
            if link.conversation.is_some() {
                // Lost a race with a concurrent attach.
                return;
            }
            link.generation += 1;
            link.conversation = Some(conversation.clone());
            link.state = ConnectionState::Connecting;
            link.degraded = false;
            let supervisor = tokio::spawn(supervise(
                Arc::clone(&self.shared),
                link.generation,
                conversation.clone(),
                inbound,
                ready_tx,
            ));
            link.supervisor = Some(supervisor);
        }
        let _ = ready_rx.await;
    }

    /// Closes the transport and stops reconnecting. Idempotent.
    pub async fn detach(&self) {
        let (conversation, supervisor, transport) = {
            let mut link = self.shared.link.lock();
            link.generation += 1;
            link.state = ConnectionState::Disconnected;
            link.degraded = false;
            (
                link.conversation.take(),
                link.supervisor.take(),
                link.transport.take(),
            )
        };
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        if let Some(conversation) = conversation {
            tracing::info!(conversation = %conversation, "transport detached");
        }
    }

    /// Synchronous teardown for `Drop` paths: stops the supervisor and
    /// releases the transport without a close handshake.
    pub fn abort(&self) {
        let mut link = self.shared.link.lock();
        link.generation += 1;
        link.state = ConnectionState::Disconnected;
        link.conversation = None;
        link.transport = None;
        if let Some(supervisor) = link.supervisor.take() {
            supervisor.abort();
        }
    }

    /// Sends a command over the live session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] when no session is open,
    /// or whatever the transport reports.
    pub async fn send(&self, command: &ClientCommand) -> Result<(), TransportError> {
        let transport = self
            .shared
            .link
            .lock()
            .transport
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;
        transport.send(command).await
    }

    /// Whether a session is open right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let link = self.shared.link.lock();
        link.state == ConnectionState::Connected
            && link.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.link.lock().state
    }

    /// Whether the retry budget has been spent.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.shared.link.lock().degraded
    }

    /// Conversation currently attached, if any.
    #[must_use]
    pub fn conversation(&self) -> Option<ConversationId> {
        self.shared.link.lock().conversation.clone()
    }
}

impl<C: Connector> Shared<C> {
    /// Updates the link state if `generation` is still current, and tells
    /// the session. Returns `false` for a stale generation.
    async fn publish(
        &self,
        generation: u64,
        state: ConnectionState,
        degraded: bool,
        inbound: &mpsc::Sender<Inbound>,
    ) -> bool {
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return false;
            }
            link.state = state;
            link.degraded = degraded;
            if state != ConnectionState::Connected {
                link.transport = None;
            }
        }
        if inbound.send(Inbound::State { state, degraded }).await.is_err() {
            tracing::debug!(?state, "session gone, state change not delivered");
        }
        true
    }

    /// Connects within the retry budget. `None` means degraded, refused, or
    /// superseded by a detach.
    async fn establish(
        &self,
        generation: u64,
        conversation: &ConversationId,
        inbound: &mpsc::Sender<Inbound>,
        ready: &mut Option<oneshot::Sender<()>>,
    ) -> Option<Arc<C::Transport>> {
        let max_attempts = self.reconnect.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if !self.publish(generation, ConnectionState::Connecting, false, inbound).await {
                return None;
            }
            let outcome =
                tokio::time::timeout(self.reconnect.connect_timeout, self.connector.connect(conversation))
                    .await
                    .unwrap_or(Err(TransportError::Timeout));

            match outcome {
                Ok(transport) => {
                    let transport = Arc::new(transport);
                    let join = ClientCommand::JoinChat {
                        conversation_id: conversation.clone(),
                    };
                    match transport.send(&join).await {
                        Ok(()) => {
                            if self.install(generation, &transport, inbound).await {
                                tracing::info!(conversation = %conversation, attempt, "transport attached");
                                return Some(transport);
                            }
                            transport.close().await;
                            return None;
                        }
                        Err(e) => {
                            tracing::warn!(conversation = %conversation, attempt, error = %e, "joinChat failed");
                            transport.close().await;
                        }
                    }
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(conversation = %conversation, error = %e, "transport refused");
                    if self.publish(generation, ConnectionState::Disconnected, true, inbound).await {
                        let _ = inbound.send(Inbound::Refused(Arc::new(e))).await;
                    }
                    return None;
                }
                Err(e) => {
                    tracing::warn!(conversation = %conversation, attempt, error = %e, "transport connect failed");
                }
            }

            if attempt < max_attempts {
                settle(ready);
                tokio::time::sleep(self.reconnect.backoff).await;
            }
        }

        if self.publish(generation, ConnectionState::Disconnected, true, inbound).await {
            tracing::info!(
                conversation = %conversation,
                attempts = max_attempts,
                "transport unavailable, continuing over request/response"
            );
        }
        None
    }

    /// Stores a freshly joined transport. Returns `false` if detached meanwhile.
    async fn install(
        &self,
        generation: u64,
        transport: &Arc<C::Transport>,
        inbound: &mpsc::Sender<Inbound>,
    ) -> bool {
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return false;
            }
            link.transport = Some(Arc::clone(transport));
            link.state = ConnectionState::Connected;
            link.degraded = false;
        }
        let connected = Inbound::State {
            state: ConnectionState::Connected,
            degraded: false,
        };
        if inbound.send(connected).await.is_err() {
            tracing::debug!("session gone, connect not delivered");
        }
        true
    }

    /// Forwards events until the transport fails or the session goes away.
    async fn pump(
        &self,
        transport: &C::Transport,
        conversation: &ConversationId,
        inbound: &mpsc::Sender<Inbound>,
    ) -> TransportError {
        loop {
            let event = match transport.recv().await {
                Ok(event) => event,
                Err(e) => return e,
            };
            if event.conversation_id().is_some_and(|c| c != conversation) {
                tracing::debug!(conversation = %conversation, "discarding event for another conversation");
                continue;
            }
            if let ServerEvent::NewMessage(message) = &event {
                if message.sender.id != self.local_user {
                    let ack = ClientCommand::MarkAsRead {
                        conversation_id: conversation.clone(),
                        message_ids: vec![message.id.clone()],
                    };
                    if let Err(e) = transport.send(&ack).await {
                        tracing::debug!(message_id = %message.id, error = %e, "read acknowledgement failed");
                    }
                }
            }
            if inbound.send(Inbound::Event(event)).await.is_err() {
                return TransportError::ConnectionClosed;
            }
        }
    }
}

/// Connects, pumps, and reconnects until detached, refused, or degraded.
async fn supervise<C: Connector>(
    shared: Arc<Shared<C>>,
    generation: u64,
    conversation: ConversationId,
    inbound: mpsc::Sender<Inbound>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    loop {
        let transport = shared.establish(generation, &conversation, &inbound, &mut ready).await;
        settle(&mut ready);
        let Some(transport) = transport else {
            return;
        };

        let error = shared.pump(&transport, &conversation, &inbound).await;
        transport.close().await;
        if inbound.is_closed() {
            return;
        }
        if !shared.publish(generation, ConnectionState::Disconnected, false, &inbound).await {
            return;
        }
        if !error.is_retryable() {
            tracing::warn!(conversation = %conversation, error = %error, "transport closed by server");
            if shared.publish(generation, ConnectionState::Disconnected, true, &inbound).await {
                let _ = inbound.send(Inbound::Refused(Arc::new(error))).await;
            }
            return;
        }
        tracing::warn!(conversation = %conversation, error = %error, "transport lost, reconnecting");
    }
}

/// Releases a pending `attach`, once.
fn settle(ready: &mut Option<oneshot::Sender<()>>) {
    if let Some(ready) = ready.take() {
        let _ = ready.send(());
    }
}
