//! Backwards pagination cursor for one conversation.
//!
//! The cursor owns no I/O. A caller asks [`PaginationCursor::begin`] for a
//! [`Ticket`], performs the fetch, and reports the page back with
//! [`PaginationCursor::finish`]. At most one fetch is in flight at a time,
//! and a reset invalidates every ticket issued before it.

use whisper_proto::message::{Message, MessageId};

/// Permission to run one history fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
    seq: u64,
    /// Fetch messages strictly older than this one (`None` = newest page).
    pub before: Option<MessageId>,
}

/// Outcome of [`PaginationCursor::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// Go ahead and fetch.
    Go(Ticket),
    /// Another older-page fetch is outstanding.
    InFlight,
    /// The server has no older history.
    Exhausted,
}

/// Tracks how far back history has been loaded.
#[derive(Debug, Clone)]
pub struct PaginationCursor {
    oldest_loaded: Option<MessageId>,
    has_more: bool,
    in_flight: Option<u64>,
    generation: u64,
    next_seq: u64,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl PaginationCursor {
    /// A cursor that has loaded nothing yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            oldest_loaded: None,
            has_more: true,
            in_flight: None,
            generation: 0,
            next_seq: 0,
        }
    }

    /// Claims the single older-page slot.
    ///
    /// `anchor` is the oldest message still loaded. The ticket fetches before
    /// it, or before the last page's oldest entry when nothing is loaded, so a
    /// deleted anchor never pins the cursor.
    pub fn begin(&mut self, anchor: Option<&MessageId>) -> Begin {
        if self.in_flight.is_some() {
            return Begin::InFlight;
        }
        if !self.has_more {
            return Begin::Exhausted;
        }
        self.next_seq += 1;
        self.in_flight = Some(self.next_seq);
        Begin::Go(Ticket {
            generation: self.generation,
            seq: self.next_seq,
            before: anchor.or(self.oldest_loaded.as_ref()).cloned(),
        })
    }

    /// Records a fetched page. Returns `false`, changing nothing, when the
    /// ticket predates a reset and the page must be discarded.
    pub fn finish(&mut self, ticket: &Ticket, page: &[Message], page_size: usize) -> bool {
        if self.in_flight == Some(ticket.seq) {
            self.in_flight = None;
        }
        if ticket.generation != self.generation {
            return false;
        }
        self.apply(page, page_size);
        true
    }

    /// Releases the slot after a failed fetch (older page or reset).
    pub fn abandon(&mut self, ticket: &Ticket) {
        if self.in_flight == Some(ticket.seq) {
            self.in_flight = None;
        }
    }

    /// Starts a reset: invalidates outstanding tickets and claims the slot
    /// for the newest-page fetch, so no older page is requested meanwhile.
    pub fn begin_reset(&mut self) -> Ticket {
        self.generation += 1;
        self.next_seq += 1;
        self.in_flight = Some(self.next_seq);
        Ticket {
            generation: self.generation,
            seq: self.next_seq,
            before: None,
        }
    }

    /// Records the newest page fetched by a reset. Returns `false` when a
    /// later reset superseded this one.
    pub fn finish_reset(&mut self, ticket: &Ticket, page: &[Message], page_size: usize) -> bool {
        if self.in_flight == Some(ticket.seq) {
            self.in_flight = None;
        }
        if ticket.generation != self.generation {
            return false;
        }
        self.oldest_loaded = None;
        self.apply(page, page_size);
        true
    }

    /// Whether older history may exist.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    /// Whether an older-page fetch is outstanding.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Id of the oldest message loaded so far.
    #[must_use]
    pub const fn oldest_loaded(&self) -> Option<&MessageId> {
        self.oldest_loaded.as_ref()
    }

    fn apply(&mut self, page: &[Message], page_size: usize) {
        if let Some(oldest) = page.iter().min_by_key(|m| m.timestamp) {
            self.oldest_loaded = Some(oldest.id.clone());
        }
        self.has_more = page.len() >= page_size;
    }
}
