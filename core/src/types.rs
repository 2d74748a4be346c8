/// Shared types for conversations and messages
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Server-assigned conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier.
///
/// Positive ids are server-confirmed and globally unique. Negative ids are
/// temporary ids handed out locally for optimistic entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
    pub fn is_temporary(&self) -> bool {
        self.0 < 0
    }

    pub fn is_confirmed(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated idempotency token attached to every outbound message.
///
/// The server echoes it in the send response and in the real-time payload, which
/// ties an echo to its optimistic slot regardless of arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientToken(pub Uuid);

impl ClientToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

/// Preview of the latest message shown in the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: MessageId,
    pub sender_id: ParticipantId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub has_media: bool,
    pub created_at: DateTime<Utc>,
}

/// Booking context attached to a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripMetadata {
    #[serde(default)]
    pub listing_id: Option<u64>,
    #[serde(default)]
    pub listing_title: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub check_in: Option<NaiveDate>,
    #[serde(default)]
    pub check_out: Option<NaiveDate>,
}

/// One row of the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<MessageSummary>,
    #[serde(default)]
    pub trip: Option<TripMetadata>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

impl ConversationSummary {
    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// First participant that is not `me`, used as the conversation title.
    pub fn counterpart(&self, me: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id != me)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    User,
    System,
}

/// Reference to an uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Image picked by the user and not yet uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl ImageFile {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

/// What the user asked to send. Kept verbatim until the send is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingPayload {
    Text(String),
    Image(ImageFile),
}

impl OutgoingPayload {
    pub fn text(&self) -> Option<&str> {
        match self {
            OutgoingPayload::Text(t) => Some(t),
            OutgoingPayload::Image(_) => None,
        }
    }
}

/// Local delivery state of a timeline entry.
///
/// Only entries created on this client carry anything other than `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryTag {
    #[default]
    Sent,
    Sending(MessageId),
    Error(MessageId),
}

impl DeliveryTag {
    pub fn is_pending(&self) -> bool {
        !matches!(self, DeliveryTag::Sent)
    }
}

/// A message as held in the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub message_type: MessageType,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media: Option<MediaRef>,
    pub created_at: DateTime<Utc>,
    pub sender_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<ClientToken>,
    #[serde(skip)]
    pub delivery: DeliveryTag,
}

impl HistoryMessage {
    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            id: self.id,
            sender_id: self.sender_id,
            content: self.content.clone(),
            has_media: self.media.is_some(),
            created_at: self.created_at,
        }
    }
}

/// Message returned by the send endpoints.
pub type ServerMessage = HistoryMessage;

/// One page of an offset-paginated listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    pub next: bool,
}

impl<T> Page<T> {
    pub fn new(results: Vec<T>, next: bool) -> Self {
        Self { results, next }
    }

    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            next: false,
        }
    }
}
