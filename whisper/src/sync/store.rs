//! Per-conversation message store.
//!
//! Holds the messages of the active conversation in non-decreasing
//! timestamp order (ties keep insertion order) with at most one entry per
//! id. Every mutation restores both properties before returning, so callers
//! never observe an unsorted or duplicated list.

use whisper_proto::message::{Message, MessageId, MessageStatus, UserId};

/// Result of [`MessageStore::replace_provisional`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The provisional entry now carries the confirmed id.
    Swapped,
    /// The confirmed id was already present (its echo arrived first); the
    /// provisional entry, if any, was folded into it.
    Collapsed,
    /// Neither entry exists any more, typically because the user deleted the
    /// message while it was in flight.
    Missing,
}

/// Ordered, de-duplicated list of messages.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    /// Creates an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    /// Replaces the contents with `page`.
    ///
    /// Provisional entries whose send is still unresolved (or failed and
    /// awaiting retry) survive, unless the page already holds their
    /// confirmed copy.
    pub fn seed(&mut self, page: Vec<Message>) {
        let pending: Vec<Message> = std::mem::take(&mut self.messages)
            .into_iter()
            .filter(|m| m.id.is_provisional())
            .filter(|m| matches!(m.status, MessageStatus::Sending | MessageStatus::Failed))
            .filter(|m| !page.iter().any(|p| p.client_id.as_ref() == Some(&m.id)))
            .collect();
        self.merge(page);
        self.merge(pending);
    }

    /// Inserts or updates each message by id, then re-sorts.
    ///
    /// Content, timestamp and sender of an existing entry take the incoming
    /// values. Status only moves forward (see [`MessageStatus::rank`]) and
    /// `read` never reverts to `false`. Merging the same messages again is
    /// a no-op.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Message>) {
        for message in incoming {
            match self.position(&message.id) {
                Some(pos) => absorb(&mut self.messages[pos], message),
                None => self.messages.push(message),
            }
        }
        self.sort();
    }

    /// Sets the status of `id`, leaving its position unchanged.
    ///
    /// Returns `false` if no such message exists.
    pub fn upsert_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        match self.messages.iter_mut().find(|m| m.id == *id) {
            Some(message) => {
                message.status = status;
                true
            }
            None => false,
        }
    }

    /// Removes `id`, returning the removed entry.
    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let pos = self.position(id)?;
        Some(self.messages.remove(pos))
    }

    /// Swaps a provisional entry for its server-confirmed copy in one step.
    ///
    /// If the confirmed id is already present the two collapse into a
    /// single entry; the store never holds both.
    pub fn replace_provisional(&mut self, provisional: &MessageId, mut confirmed: Message) -> Reconciled {
        if confirmed.client_id.is_none() && provisional.is_provisional() {
            confirmed.client_id = Some(provisional.clone());
        }
        let provisional_pos = self.position(provisional);
        let confirmed_present = self.position(&confirmed.id).is_some();

        match (provisional_pos, confirmed_present) {
            (Some(pos), false) => {
                self.messages[pos] = confirmed;
                self.sort();
                Reconciled::Swapped
            }
            (Some(pos), true) => {
                self.messages.remove(pos);
                self.merge([confirmed]);
                Reconciled::Collapsed
            }
            (None, true) => {
                self.merge([confirmed]);
                Reconciled::Collapsed
            }
            (None, false) => Reconciled::Missing,
        }
    }

    /// Provisional entry that `echo` confirms, if any.
    ///
    /// Matches on the echoed `client_id` first, then falls back to the oldest
    /// provisional entry by the same sender with identical content.
    #[must_use]
    pub fn find_provisional_echo(&self, echo: &Message) -> Option<MessageId> {
        if self.position(&echo.id).is_some() {
            return None;
        }
        if let Some(client_id) = &echo.client_id {
            if self.position(client_id).is_some() {
                return Some(client_id.clone());
            }
        }
        self.messages
            .iter()
            .find(|m| {
                m.id.is_provisional()
                    && m.sender.id == echo.sender.id
                    && m.content == echo.content
            })
            .map(|m| m.id.clone())
    }

    /// Flags every incoming message as read, returning the server ids that
    /// changed.
    pub fn mark_incoming_read(&mut self, local_user: &UserId) -> Vec<MessageId> {
        self.messages
            .iter_mut()
            .filter(|m| !m.read && !m.is_from(local_user) && !m.id.is_provisional())
            .map(|m| {
                m.read = true;
                m.id.clone()
            })
            .collect()
    }

    /// Number of incoming messages the local user has not seen.
    #[must_use]
    pub fn unread_count(&self, local_user: &UserId) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.read && !m.is_from(local_user))
            .count()
    }

    /// Looks up a message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == *id)
    }

    /// Oldest server-confirmed message.
    #[must_use]
    pub fn oldest(&self) -> Option<&Message> {
        self.messages.iter().find(|m| !m.id.is_provisional())
    }

    /// All messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == *id)
    }

    fn sort(&mut self) {
        // Stable: equal timestamps keep insertion order.
        self.messages.sort_by_key(|m| m.timestamp);
    }
}

/// Folds a newer copy of a message into the stored one.
fn absorb(existing: &mut Message, incoming: Message) {
    existing.content = incoming.content;
    existing.timestamp = incoming.timestamp;
    existing.sender.id = incoming.sender.id;
    if incoming.sender.username.is_some() {
        existing.sender.username = incoming.sender.username;
    }
    if incoming.status.rank() >= existing.status.rank() {
        existing.status = incoming.status;
    }
    existing.read |= incoming.read;
    if incoming.client_id.is_some() {
        existing.client_id = incoming.client_id;
    }
}
