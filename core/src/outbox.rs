/// Payloads of optimistic messages awaiting confirmation
use crate::error::FetchError;
use crate::types::{ClientToken, MessageId, OutgoingPayload};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub temp_id: MessageId,
    pub token: ClientToken,
    pub payload: OutgoingPayload,
    /// Number of send requests issued so far
    pub attempts: u32,
    pub last_error: Option<FetchError>,
}

/// Unconfirmed sends keyed by temporary id, with a reverse index by token.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: HashMap<MessageId, OutboxEntry>,
    by_token: HashMap<ClientToken, MessageId>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, temp_id: MessageId, token: ClientToken, payload: OutgoingPayload) {
        self.by_token.insert(token, temp_id);
        self.entries.insert(
            temp_id,
            OutboxEntry {
                temp_id,
                token,
                payload,
                attempts: 1,
                last_error: None,
            },
        );
    }

    pub fn get(&self, temp_id: MessageId) -> Option<&OutboxEntry> {
        self.entries.get(&temp_id)
    }

    pub fn get_mut(&mut self, temp_id: MessageId) -> Option<&mut OutboxEntry> {
        self.entries.get_mut(&temp_id)
    }

    pub fn temp_id_for(&self, token: &ClientToken) -> Option<MessageId> {
        self.by_token.get(token).copied()
    }

    pub fn remove(&mut self, temp_id: MessageId) -> Option<OutboxEntry> {
        let entry = self.entries.remove(&temp_id)?;
        self.by_token.remove(&entry.token);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
