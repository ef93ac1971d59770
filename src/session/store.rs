// Ordered, deduplicated in-memory message collection for the open
// conversation, and the cursor that drives backward history fetches.

use log::debug;
use std::collections::HashSet;

use crate::models::{Message, MessageId};

/// Messages of the open conversation, ascending by timestamp. Dedup is by
/// id; order is maintained at each mutation, never by a global re-sort.
pub struct MessageStore {
    entries: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        MessageStore {
            entries: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries.iter().find(|m| &m.id == id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.clone()
    }

    /// Insert keeping ascending timestamp order. New messages almost always
    /// land at the tail; an older timestamp walks back to its slot. Equal
    /// timestamps keep insertion order. Returns false when the id is
    /// already present.
    pub fn append(&mut self, msg: Message) -> bool {
        if self.ids.contains(&msg.id) {
            return false;
        }
        self.ids.insert(msg.id.clone());
        let mut idx = self.entries.len();
        while idx > 0 && self.entries[idx - 1].timestamp > msg.timestamp {
            idx -= 1;
        }
        self.entries.insert(idx, msg);
        true
    }

    /// Prepend an ascending batch of older history, skipping ids already
    /// present. Returns how many entries were actually inserted.
    pub fn prepend(&mut self, batch: Vec<Message>) -> usize {
        let mut fresh: Vec<Message> = Vec::with_capacity(batch.len());
        for msg in batch {
            if self.ids.contains(&msg.id) {
                debug!("prepend: skipping duplicate {}", msg.id);
                continue;
            }
            self.ids.insert(msg.id.clone());
            fresh.push(msg);
        }
        let count = fresh.len();
        if count > 0 {
            self.entries.splice(0..0, fresh);
        }
        count
    }

    /// Swap the record stored under `id` for `replacement`, keeping its list
    /// position. Reconciliation must never move a message the user is
    /// already looking at.
    pub fn replace(&mut self, id: &MessageId, replacement: Message) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        self.ids.remove(id);
        self.ids.insert(replacement.id.clone());
        self.entries[idx] = replacement;
        true
    }

    /// Edit a record in place and return a clone of the result. The closure
    /// must not change the id; use `replace` for that.
    pub fn modify<F>(&mut self, id: &MessageId, f: F) -> Option<Message>
    where
        F: FnOnce(&mut Message),
    {
        let idx = self.position(id)?;
        f(&mut self.entries[idx]);
        Some(self.entries[idx].clone())
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let idx = self.position(id)?;
        self.ids.remove(id);
        Some(self.entries.remove(idx))
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|m| &m.id == id)
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        MessageStore::new()
    }
}

/// In-flight state of a history fetch. Part of the cursor itself so two
/// loads can never race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Loading,
}

/// Tracks the oldest loaded timestamp and whether more history exists.
#[derive(Debug)]
pub struct PaginationCursor {
    oldest_loaded: Option<i64>,
    has_more: bool,
    fetch_state: FetchState,
}

impl PaginationCursor {
    pub fn new() -> Self {
        PaginationCursor {
            oldest_loaded: None,
            has_more: true,
            fetch_state: FetchState::Idle,
        }
    }

    pub fn oldest_loaded(&self) -> Option<i64> {
        self.oldest_loaded
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.fetch_state == FetchState::Loading
    }

    /// Guard for a history fetch: returns false (caller no-ops) when a load
    /// is already in flight or history is exhausted.
    pub fn begin_fetch(&mut self) -> bool {
        if self.fetch_state == FetchState::Loading || !self.has_more {
            return false;
        }
        self.fetch_state = FetchState::Loading;
        true
    }

    /// Record a successfully fetched page. `page_oldest` is the oldest
    /// timestamp in the page, `None` for an empty page. `has_more` flips to
    /// false once a page comes back short, and stays false until `reset`.
    pub fn finish_page(&mut self, page_oldest: Option<i64>, fetched: usize, page_size: usize) {
        self.fetch_state = FetchState::Idle;
        if let Some(ts) = page_oldest {
            self.oldest_loaded = Some(ts);
        }
        if fetched < page_size {
            self.has_more = false;
        }
    }

    /// A failed fetch leaves the boundary and `has_more` untouched; it is
    /// safe to retry.
    pub fn fail_fetch(&mut self) {
        self.fetch_state = FetchState::Idle;
    }

    pub fn reset(&mut self) {
        *self = PaginationCursor::new();
    }
}

impl Default for PaginationCursor {
    fn default() -> Self {
        PaginationCursor::new()
    }
}
