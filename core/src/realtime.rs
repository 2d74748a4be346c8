/// Real-time payload decoding and an in-process channel hub
use crate::api::{RealtimeSubscription, RealtimeTransport, SubscriptionGuard};
use crate::error::{FetchError, RealtimeDecodeError};
use crate::types::{
    ClientToken, ConversationId, HistoryMessage, MediaRef, MessageId, MessageType, ParticipantId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Kind of a pushed event, taken from its `type` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    User,
    System,
    Other(String),
}

/// A decoded real-time event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeEvent {
    pub chat_id: ConversationId,
    pub kind: EventKind,
    /// Present for `User` and `System` events.
    pub message: Option<HistoryMessage>,
}

#[derive(Debug, Deserialize)]
struct SenderRef {
    id: ParticipantId,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    chat_id: Option<ConversationId>,
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<MessageId>,
    #[serde(default)]
    sender_id: Option<ParticipantId>,
    #[serde(default)]
    sender: Option<SenderRef>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    media: Option<MediaRef>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    client_token: Option<ClientToken>,
}

/// Wire shape of a pushed message, as produced by the backend.
#[derive(Debug, Serialize)]
struct OutgoingEvent<'a> {
    chat_id: ConversationId,
    #[serde(rename = "type")]
    kind: MessageType,
    id: MessageId,
    sender_id: ParticipantId,
    content: &'a Option<String>,
    media: &'a Option<MediaRef>,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_token: Option<ClientToken>,
}

/// Decodes one raw payload.
pub fn decode_event(raw: &str) -> Result<RealtimeEvent, RealtimeDecodeError> {
    let ev: RawEvent =
        serde_json::from_str(raw).map_err(|e| RealtimeDecodeError::Malformed(e.to_string()))?;

    let chat_id = ev.chat_id.ok_or(RealtimeDecodeError::MissingField("chat_id"))?;
    let kind = match ev.kind.as_deref() {
        Some("USER") => EventKind::User,
        Some("SYSTEM") => EventKind::System,
        Some(other) => EventKind::Other(other.to_string()),
        None => return Err(RealtimeDecodeError::MissingField("type")),
    };
    let message_type = match kind {
        EventKind::User => MessageType::User,
        EventKind::System => MessageType::System,
        EventKind::Other(_) => {
            return Ok(RealtimeEvent {
                chat_id,
                kind,
                message: None,
            })
        }
    };

    let id = ev.id.ok_or(RealtimeDecodeError::MissingField("id"))?;
    // Temporary ids never come from the server.
    if !id.is_confirmed() {
        return Err(RealtimeDecodeError::InvalidField("id"));
    }
    let created_at = ev
        .created_at
        .ok_or(RealtimeDecodeError::MissingField("created_at"))?;
    let sender_id = ev
        .sender_id
        .or(ev.sender.map(|s| s.id))
        .ok_or(RealtimeDecodeError::MissingField("sender_id"))?;

    Ok(RealtimeEvent {
        chat_id,
        kind,
        message: Some(HistoryMessage {
            id,
            message_type,
            content: ev.content,
            media: ev.media,
            created_at,
            sender_id,
            client_token: ev.client_token,
            delivery: Default::default(),
        }),
    })
}

/// Encodes a confirmed message as a pushed event.
pub fn encode_message_event(
    chat_id: ConversationId,
    message: &HistoryMessage,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&OutgoingEvent {
        chat_id,
        kind: message.message_type,
        id: message.id,
        sender_id: message.sender_id,
        content: &message.content,
        media: &message.media,
        created_at: message.created_at,
        client_token: message.client_token,
    })
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    channels: HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>,
}

/// In-process real-time transport.
///
/// Payloads published on a channel key reach every live subscriber of that key.
#[derive(Clone, Default)]
pub struct LocalRealtimeHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LocalRealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes one payload. Returns how many subscribers received it.
    pub fn publish(&self, channel_key: &str, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subs) = inner.channels.get_mut(channel_key) else {
            return 0;
        };
        subs.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        subs.len()
    }

    pub fn subscriber_count(&self, channel_key: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.channels.get(channel_key).map_or(0, |subs| subs.len())
    }
}

impl RealtimeTransport for LocalRealtimeHub {
    fn subscribe(&self, channel_key: &str) -> Result<RealtimeSubscription, FetchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.next_id += 1;
            let sub_id = inner.next_id;
            inner
                .channels
                .entry(channel_key.to_string())
                .or_default()
                .push((sub_id, tx));
            sub_id
        };
        debug!("Local subscriber {} joined {}", sub_id, channel_key);

        let hub = self.inner.clone();
        let key = channel_key.to_string();
        let guard = SubscriptionGuard::new(channel_key, move || {
            let mut inner = hub.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(subs) = inner.channels.get_mut(&key) {
                subs.retain(|(id, _)| *id != sub_id);
                if subs.is_empty() {
                    inner.channels.remove(&key);
                }
            }
        });
        Ok(RealtimeSubscription::new(rx, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HistoryMessage {
        HistoryMessage {
            id: MessageId(501),
            message_type: MessageType::User,
            content: Some("Hello".to_string()),
            media: None,
            created_at: "2026-03-01T10:00:00Z".parse().unwrap(),
            sender_id: ParticipantId(7),
            client_token: Some(ClientToken::new()),
            delivery: Default::default(),
        }
    }

    #[test]
    fn test_encode_then_decode_message_event() {
        let msg = sample();
        let raw = encode_message_event(ConversationId(3), &msg).unwrap();
        let ev = decode_event(&raw).unwrap();
        assert_eq!(ev.chat_id, ConversationId(3));
        assert_eq!(ev.kind, EventKind::User);
        assert_eq!(ev.message, Some(msg));
    }

    #[test]
    fn test_decode_nested_sender() {
        let raw = r#"{"chat_id":1,"type":"USER","id":9,"sender":{"id":4},"content":"hi","created_at":"2026-03-01T10:00:00Z"}"#;
        let ev = decode_event(raw).unwrap();
        assert_eq!(ev.message.unwrap().sender_id, ParticipantId(4));
    }

    #[test]
    fn test_decode_unknown_kind_has_no_message() {
        let raw = r#"{"chat_id":1,"type":"TYPING"}"#;
        let ev = decode_event(raw).unwrap();
        assert_eq!(ev.kind, EventKind::Other("TYPING".to_string()));
        assert!(ev.message.is_none());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode_event("not json"), Err(RealtimeDecodeError::Malformed(_))));
        assert_eq!(
            decode_event(r#"{"type":"USER"}"#),
            Err(RealtimeDecodeError::MissingField("chat_id"))
        );
        assert_eq!(
            decode_event(r#"{"chat_id":1,"type":"USER","sender_id":2,"created_at":"2026-03-01T10:00:00Z"}"#),
            Err(RealtimeDecodeError::MissingField("id"))
        );
        for id in [-1, 0] {
            let raw = format!(
                r#"{{"chat_id":1,"type":"USER","id":{},"sender_id":2,"created_at":"2026-03-01T10:00:00Z"}}"#,
                id
            );
            assert_eq!(decode_event(&raw), Err(RealtimeDecodeError::InvalidField("id")));
        }
    }

    #[tokio::test]
    async fn test_hub_delivers_and_unsubscribes() {
        let hub = LocalRealtimeHub::new();
        let sub = hub.subscribe("chat-1").unwrap();
        let (mut events, guard) = sub.into_parts();
        assert_eq!(hub.subscriber_count("chat-1"), 1);

        assert_eq!(hub.publish("chat-1", "a"), 1);
        assert_eq!(hub.publish("chat-2", "b"), 0);
        assert_eq!(events.recv().await.as_deref(), Some("a"));

        drop(guard);
        assert_eq!(hub.subscriber_count("chat-1"), 0);
        assert_eq!(hub.publish("chat-1", "c"), 0);
    }
}
