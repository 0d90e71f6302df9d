//! Ordered message log for a single conversation.
//!
//! Messages live in an append-only arena of slots; an id index maps both
//! temporary local ids and server ids to their slot so confirm, rollback and
//! the duplicate check are O(1). Rollback leaves a tombstone which is
//! compacted away once tombstones outnumber live entries.

use crate::chat::{ChatMessage, MessageDraft};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

const LOCAL_PREFIX: &str = "local-";
const COMPACT_THRESHOLD: usize = 64;

/// Temporary id of an optimistic placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalId(String);

impl LocalId {
    fn generate() -> Self {
        Self(format!("{}{}", LOCAL_PREFIX, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Pending(ChatMessage),
    Confirmed(ChatMessage),
    Tombstone,
}

impl Slot {
    fn message(&self) -> Option<&ChatMessage> {
        match self {
            Slot::Pending(m) | Slot::Confirmed(m) => Some(m),
            Slot::Tombstone => None,
        }
    }
}

/// Outcome of reconciling a placeholder with the server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Replaced,
    /// The realtime echo landed first; it was folded into the placeholder slot.
    MergedEcho,
    /// Placeholder already gone (rolled back or confirmed).
    Unknown,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    live: usize,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a placeholder at the tail. Never touches the network.
    pub fn append_optimistic(
        &mut self,
        draft: &MessageDraft,
        sender_id: &str,
        now: DateTime<Utc>,
    ) -> LocalId {
        let local_id = LocalId::generate();
        let message = ChatMessage {
            id: local_id.0.clone(),
            chat_id: None,
            sender_id: sender_id.to_string(),
            content: draft.content.clone(),
            created_at: now,
            read: true,
            kind: draft.kind,
            image_url: draft.image_url.clone(),
            metadata: draft.metadata.clone(),
        };
        self.push(Slot::Pending(message));
        local_id
    }

    pub fn confirm(&mut self, local_id: &LocalId, server_message: ChatMessage) -> Confirmation {
        let Some(&slot) = self.index.get(local_id.as_str()) else {
            return Confirmation::Unknown;
        };
        if !matches!(self.slots[slot], Slot::Pending(_)) {
            return Confirmation::Unknown;
        }

        let mut outcome = Confirmation::Replaced;
        if let Some(&echo) = self.index.get(&server_message.id) {
            if echo != slot {
                self.slots[echo] = Slot::Tombstone;
                self.live -= 1;
                outcome = Confirmation::MergedEcho;
            }
        }

        self.index.remove(local_id.as_str());
        self.index.insert(server_message.id.clone(), slot);
        self.slots[slot] = Slot::Confirmed(server_message);
        self.maybe_compact();
        outcome
    }

    /// Remove a placeholder, handing it back so the draft can be restored.
    pub fn rollback(&mut self, local_id: &LocalId) -> Option<ChatMessage> {
        let &slot = self.index.get(local_id.as_str())?;
        if !matches!(self.slots[slot], Slot::Pending(_)) {
            return None;
        }
        self.index.remove(local_id.as_str());
        let removed = std::mem::replace(&mut self.slots[slot], Slot::Tombstone);
        self.live -= 1;
        self.maybe_compact();
        match removed {
            Slot::Pending(m) => Some(m),
            _ => None,
        }
    }

    /// Append a message pushed by the server. Returns false for duplicates.
    pub fn ingest_remote(&mut self, message: ChatMessage) -> bool {
        if self.index.contains_key(&message.id) {
            return false;
        }
        self.push(Slot::Confirmed(message));
        true
    }

    /// Ingest history in server order. Returns how many were new.
    pub fn load_history(&mut self, messages: impl IntoIterator<Item = ChatMessage>) -> usize {
        messages
            .into_iter()
            .filter(|m| !m.id.starts_with(LOCAL_PREFIX))
            .map(|m| self.ingest_remote(m))
            .filter(|inserted| *inserted)
            .count()
    }

    /// Flip the read flag of a confirmed message. Returns true if it changed.
    pub fn mark_read(&mut self, id: &str) -> bool {
        let Some(&slot) = self.index.get(id) else {
            return false;
        };
        match &mut self.slots[slot] {
            Slot::Confirmed(m) if !m.read => {
                m.read = true;
                true
            }
            _ => false,
        }
    }

    /// Mark every message not sent by `reader` as read. Returns the ids flipped.
    pub fn mark_all_read(&mut self, reader: &str) -> Vec<String> {
        let mut flipped = Vec::new();
        for slot in &mut self.slots {
            if let Slot::Confirmed(m) = slot {
                if !m.read && m.sender_id != reader {
                    m.read = true;
                    flipped.push(m.id.clone());
                }
            }
        }
        flipped
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.index.get(id).and_then(|&slot| self.slots[slot].message())
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.index
            .get(id)
            .map_or(false, |&slot| matches!(self.slots[slot], Slot::Pending(_)))
    }

    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Pending(_)))
            .count()
    }

    pub fn unread_count(&self, reader: &str) -> usize {
        self.iter().filter(|m| !m.read && m.sender_id != reader).count()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.slots.iter().rev().find_map(Slot::message)
    }

    /// Messages in local append order.
    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.slots.iter().filter_map(Slot::message)
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.iter().cloned().collect()
    }

    fn push(&mut self, slot: Slot) {
        if let Some(m) = slot.message() {
            self.index.insert(m.id.clone(), self.slots.len());
        }
        self.slots.push(slot);
        self.live += 1;
    }

    fn maybe_compact(&mut self) {
        let dead = self.slots.len() - self.live;
        if dead < COMPACT_THRESHOLD || dead < self.live {
            return;
        }
        self.slots.retain(|s| !matches!(s, Slot::Tombstone));
        self.index = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.message().map(|m| (m.id.clone(), i)))
            .collect();
    }
}
