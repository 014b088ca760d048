//! Applies pushed events and connection changes to a session's state.

use std::sync::Weak;

use tokio::sync::mpsc;

use whisper_proto::event::ServerEvent;
use whisper_proto::message::Message;

use super::{ConnectionState, Inbound, Inner, Session, SyncEvent};
use crate::api::ChatApi;
use crate::transport::{Connector, TransportError};

/// Drains `inbound` until the channel closes or the session is gone.
pub(super) async fn run<A: ChatApi, C: Connector>(
    session: Weak<Inner<A, C>>,
    mut inbound: mpsc::Receiver<Inbound>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        match message {
            Inbound::Event(event) => apply_event(&inner, event),
            Inbound::State { state, degraded } => {
                on_state(&inner, &session, state, degraded);
            }
            Inbound::Refused(error) => {
                if matches!(*error, TransportError::Unauthorized) {
                    inner.emit(SyncEvent::AuthenticationRequired);
                }
                inner.set_error(format!("live updates unavailable: {error}"));
            }
        }
    }
}

fn apply_event<A: ChatApi, C: Connector>(inner: &Inner<A, C>, event: ServerEvent) {
    match event {
        ServerEvent::NewMessage(message) => {
            let mut message = message.into_message(&inner.local_user);
            let own = message.is_from(&inner.local_user);
            {
                let mut state = inner.state.lock();
                if own {
                    if let Some(provisional) = state.store.find_provisional_echo(&message) {
                        tracing::debug!(message_id = %message.id, provisional = %provisional, "echo confirmed send");
                        state.store.replace_provisional(&provisional, message.clone());
                    } else {
                        state.store.merge([message.clone()]);
                    }
                } else {
                    // The conversation is open, so the message counts as seen.
                    message.read = true;
                    state.typing_users.remove(&message.sender.id);
                    state.store.merge([message.clone()]);
                }
                if let Some(stored) = state.store.get(&message.id).cloned() {
                    state.record_upsert(&stored);
                }
            }
            inner.messages_changed();
            if !own {
                emit_typing(inner);
            }
        }
        ServerEvent::MessageUpdated(message) => {
            let message = message.into_message(&inner.local_user);
            upsert(inner, message);
        }
        ServerEvent::MessageDeleted { message_id, .. } => {
            let removed = {
                let mut state = inner.state.lock();
                state.record_removal(&message_id);
                state.store.remove(&message_id).is_some()
            };
            if removed {
                inner.messages_changed();
            }
        }
        ServerEvent::UserTyping { user_id, .. } => {
            if user_id == inner.local_user {
                return;
            }
            if inner.state.lock().typing_users.insert(user_id) {
                emit_typing(inner);
            }
        }
        ServerEvent::UserStoppedTyping { user_id, .. } => {
            if inner.state.lock().typing_users.remove(&user_id) {
                emit_typing(inner);
            }
        }
        ServerEvent::UsersInChat { users, .. } => {
            inner.state.lock().connected_users = users.clone();
            inner.emit(SyncEvent::UsersChanged { users });
        }
        ServerEvent::UserJoined { user, .. } => {
            let users = {
                let mut state = inner.state.lock();
                if !state.connected_users.iter().any(|u| u.id == user.id) {
                    state.connected_users.push(user);
                }
                state.connected_users.clone()
            };
            inner.emit(SyncEvent::UsersChanged { users });
        }
        ServerEvent::UserLeft { user_id, .. } => {
            let users = {
                let mut state = inner.state.lock();
                state.connected_users.retain(|u| u.id != user_id);
                state.typing_users.remove(&user_id);
                state.connected_users.clone()
            };
            inner.emit(SyncEvent::UsersChanged { users });
        }
        ServerEvent::Error { message } => {
            tracing::warn!(conversation = %inner.conversation.id, error = %message, "server rejected a command");
            inner.set_error(message);
        }
    }
}

fn upsert<A: ChatApi, C: Connector>(inner: &Inner<A, C>, message: Message) {
    {
        let mut state = inner.state.lock();
        state.store.merge([message.clone()]);
        if let Some(stored) = state.store.get(&message.id).cloned() {
            state.record_upsert(&stored);
        }
    }
    inner.messages_changed();
}

fn emit_typing<A: ChatApi, C: Connector>(inner: &Inner<A, C>) {
    let users = inner.state.lock().typing_users.iter().cloned().collect();
    inner.emit(SyncEvent::TypingChanged { users });
}

fn on_state<A: ChatApi, C: Connector>(
    inner: &Inner<A, C>,
    session: &Weak<Inner<A, C>>,
    state: ConnectionState,
    degraded: bool,
) {
    inner.emit(SyncEvent::ConnectionChanged { state, degraded });
    if state != ConnectionState::Connected {
        if degraded {
            tracing::info!(conversation = %inner.conversation.id, "live updates unavailable, continuing over request/response");
        }
        return;
    }

    let reconnected = std::mem::replace(&mut inner.state.lock().was_connected, true);
    if !reconnected {
        return;
    }
    // Pushes were missed while the link was down.
    tracing::info!(conversation = %inner.conversation.id, "reconnected, catching up on history");
    let weak = Weak::clone(session);
    let resync = tokio::spawn(async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let session = Session { inner };
        if let Err(e) = session.catch_up().await {
            tracing::warn!(error = %e, "resync after reconnect failed");
        }
    });
    if let Some(previous) = inner.tasks.lock().resync.replace(resync) {
        previous.abort();
    }
}
