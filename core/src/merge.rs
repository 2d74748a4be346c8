/// Identity-based merging shared by the conversation feed and the message timeline
use crate::types::{ConversationId, ConversationSummary, HistoryMessage, MessageId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Records with a stable identity.
pub trait Keyed {
    type Key: Copy + Eq + Hash + Debug;

    fn key(&self) -> Self::Key;
}

impl Keyed for HistoryMessage {
    type Key = MessageId;

    fn key(&self) -> MessageId {
        self.id
    }
}

impl Keyed for ConversationSummary {
    type Key = ConversationId;

    fn key(&self) -> ConversationId {
        self.id
    }
}

/// Counts produced by a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
}

/// Ordered collection with at most one item per key and O(1) lookup by key.
#[derive(Debug, Clone)]
pub struct KeyedVec<T: Keyed> {
    items: Vec<T>,
    index: HashMap<T::Key, usize>,
}

impl<T: Keyed> Default for KeyedVec<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Keyed> KeyedVec<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds from a sequence, keeping the first position and the last value of
    /// any repeated key.
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        let mut out = Self::new();
        out.upsert_all(items);
        out
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.index.get(key).map(|&i| &self.items[i])
    }

    pub fn get_mut(&mut self, key: &T::Key) -> Option<&mut T> {
        match self.index.get(key) {
            Some(&i) => Some(&mut self.items[i]),
            None => None,
        }
    }

    pub fn position(&self, key: &T::Key) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    /// Replaces an existing item in place or appends a new one.
    /// Returns `true` when the key was new.
    pub fn upsert(&mut self, item: T) -> bool {
        let key = item.key();
        match self.index.get(&key) {
            Some(&i) => {
                self.items[i] = item;
                false
            }
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(item);
                true
            }
        }
    }

    /// Last-write-wins merge that keeps the order of first appearance.
    pub fn upsert_all(&mut self, incoming: impl IntoIterator<Item = T>) -> MergeStats {
        let mut stats = MergeStats::default();
        for item in incoming {
            if self.upsert(item) {
                stats.inserted += 1;
            } else {
                stats.updated += 1;
            }
        }
        stats
    }

    /// Inserts at the front, in the given order, every item whose key is not
    /// already present. Returns how many were inserted.
    pub fn prepend_unseen(&mut self, older: impl IntoIterator<Item = T>) -> usize {
        let mut fresh: Vec<T> = Vec::new();
        let mut seen: HashMap<T::Key, usize> = HashMap::new();
        for item in older {
            let key = item.key();
            if self.index.contains_key(&key) {
                continue;
            }
            match seen.get(&key) {
                Some(&i) => fresh[i] = item,
                None => {
                    seen.insert(key, fresh.len());
                    fresh.push(item);
                }
            }
        }

        let count = fresh.len();
        if count > 0 {
            fresh.append(&mut self.items);
            self.items = fresh;
            self.reindex();
        }
        count
    }

    /// Puts `item` into the slot currently held by `old_key`, keeping its position.
    ///
    /// If `item`'s key already lives in another slot, that other slot is dropped
    /// so the key stays unique. Returns `false` when `old_key` is unknown.
    pub fn replace_slot(&mut self, old_key: &T::Key, item: T) -> bool {
        let Some(pos) = self.position(old_key) else {
            return false;
        };
        let new_key = item.key();
        if new_key != *old_key {
            if let Some(&other) = self.index.get(&new_key) {
                self.items[pos] = item;
                self.items.remove(other);
                self.reindex();
                return true;
            }
            self.index.remove(old_key);
            self.index.insert(new_key, pos);
        }
        self.items[pos] = item;
        true
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, item) in self.items.iter().enumerate() {
            self.index.insert(item.key(), i);
        }
    }
}

impl<T: Keyed> FromIterator<T> for KeyedVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_items(iter)
    }
}
