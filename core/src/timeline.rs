/// Message timeline of one open conversation.
///
/// Merges the initial page, backward pages, real-time events and optimistic sends
/// into one ordered, duplicate-free sequence (oldest first). The timeline does no
/// I/O: each operation hands out a request ticket, and the driver feeds the result
/// back. Results whose ticket is no longer current are discarded.
use crate::delivery::DeliveryTransition;
use crate::error::{FetchError, RealtimeDecodeError, TimelineError};
use crate::ids::{Clock, SystemClock, TempIdGenerator};
use crate::merge::KeyedVec;
use crate::outbox::{Outbox, OutboxEntry};
use crate::realtime::{decode_event, EventKind, RealtimeEvent};
use crate::types::{
    ClientToken, ConversationId, DeliveryTag, HistoryMessage, ImageFile, MediaRef, MessageId,
    MessageType, OutgoingPayload, Page, ParticipantId, ServerMessage,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// State of the initial (newest page) load.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed(FetchError),
}

/// Backward pagination state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// Offset of the most recently loaded page
    pub offset: usize,
    pub has_more_older: bool,
    pub is_fetching_older: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Initial,
    Older,
}

/// Ticket for one history fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRequest {
    pub conversation_id: ConversationId,
    pub epoch: u64,
    pub generation: u64,
    pub kind: HistoryKind,
    pub offset: usize,
    pub limit: usize,
}

/// Ticket for one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTicket {
    pub conversation_id: ConversationId,
    pub epoch: u64,
    pub temp_id: MessageId,
    pub token: ClientToken,
    pub payload: OutgoingPayload,
}

/// Why an input was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Event for another conversation
    WrongConversation,
    /// Event that is not a user message
    NotUserMessage,
    /// Result of a superseded request
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOrigin {
    Local,
    Remote,
}

/// What an applied input did to the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineChange {
    /// The initial page replaced the sequence.
    Replaced { count: usize },
    /// Older messages were inserted at the front.
    Prepended { count: usize },
    /// A message was added at the end.
    Appended { id: MessageId, origin: AppendOrigin },
    /// An optimistic slot now holds its confirmed message.
    Confirmed { temp_id: MessageId, id: MessageId },
    /// An existing entry was refreshed in place.
    Updated { id: MessageId },
    Unchanged,
    Ignored(IgnoreReason),
}

impl TimelineChange {
    /// Number of entries that appeared at the tail.
    pub fn appended_count(&self) -> usize {
        match self {
            TimelineChange::Appended { .. } => 1,
            _ => 0,
        }
    }
}

pub struct MessageTimeline {
    conversation_id: ConversationId,
    me: ParticipantId,
    epoch: u64,
    generation: u64,
    page_size: usize,
    messages: KeyedVec<HistoryMessage>,
    cursor: Cursor,
    load_state: LoadState,
    older_error: Option<FetchError>,
    outbox: Outbox,
    /// Messages pushed while the initial load was running
    live_ids: HashSet<MessageId>,
    ids: TempIdGenerator,
    clock: Arc<dyn Clock>,
}

impl MessageTimeline {
    pub fn new(conversation_id: ConversationId, me: ParticipantId, page_size: usize) -> Self {
        Self::with_parts(
            conversation_id,
            me,
            page_size,
            TempIdGenerator::new(),
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        conversation_id: ConversationId,
        me: ParticipantId,
        page_size: usize,
        ids: TempIdGenerator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conversation_id,
            me,
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            generation: 0,
            page_size: page_size.max(1),
            messages: KeyedVec::new(),
            cursor: Cursor::default(),
            load_state: LoadState::Idle,
            older_error: None,
            outbox: Outbox::new(),
            live_ids: HashSet::new(),
            ids,
            clock,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn messages(&self) -> &[HistoryMessage] {
        self.messages.as_slice()
    }

    pub fn get(&self, id: MessageId) -> Option<&HistoryMessage> {
        self.messages.get(&id)
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn older_error(&self) -> Option<&FetchError> {
        self.older_error.as_ref()
    }

    /// Payload kept for an unconfirmed message.
    pub fn pending(&self, temp_id: MessageId) -> Option<&OutboxEntry> {
        self.outbox.get(temp_id)
    }

    pub fn pending_count(&self) -> usize {
        self.outbox.len()
    }

    // ─── Initial load ──────────────────────────────────────────────────────

    /// Starts (or restarts) the newest-page load. Any older-page fetch still in
    /// flight is superseded.
    pub fn begin_initial_load(&mut self) -> HistoryRequest {
        self.generation += 1;
        self.load_state = LoadState::Loading;
        self.cursor = Cursor::default();
        self.older_error = None;
        self.live_ids.clear();
        HistoryRequest {
            conversation_id: self.conversation_id,
            epoch: self.epoch,
            generation: self.generation,
            kind: HistoryKind::Initial,
            offset: 0,
            limit: self.page_size,
        }
    }

    // ─── Backward pagination ───────────────────────────────────────────────

    /// Claims the next older page, or `None` if one is already in flight, the
    /// history is exhausted, or the initial load has not succeeded.
    pub fn begin_load_older(&mut self) -> Option<HistoryRequest> {
        if self.load_state != LoadState::Ready
            || self.cursor.is_fetching_older
            || !self.cursor.has_more_older
        {
            return None;
        }
        self.cursor.is_fetching_older = true;
        self.older_error = None;
        Some(HistoryRequest {
            conversation_id: self.conversation_id,
            epoch: self.epoch,
            generation: self.generation,
            kind: HistoryKind::Older,
            offset: self.cursor.offset + self.page_size,
            limit: self.page_size,
        })
    }

    /// Applies a history page fetched for `request`.
    pub fn apply_history(
        &mut self,
        request: HistoryRequest,
        result: Result<Page<HistoryMessage>, FetchError>,
    ) -> Result<TimelineChange, TimelineError> {
        if request.conversation_id != self.conversation_id
            || request.epoch != self.epoch
            || request.generation != self.generation
        {
            debug!(
                "Discarding stale {:?} page for conversation {}",
                request.kind, request.conversation_id
            );
            return Ok(TimelineChange::Ignored(IgnoreReason::Stale));
        }
        match request.kind {
            HistoryKind::Initial => self.apply_initial(result),
            HistoryKind::Older => self.apply_older(request, result),
        }
    }

    fn apply_initial(
        &mut self,
        result: Result<Page<HistoryMessage>, FetchError>,
    ) -> Result<TimelineChange, TimelineError> {
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!("Initial load of conversation {} failed: {}", self.conversation_id, e);
                self.load_state = LoadState::Failed(e.clone());
                return Err(TimelineError::InitialLoad(e));
            }
        };

        let empty = page.results.is_empty();
        let mut fresh: KeyedVec<HistoryMessage> =
            page.results.into_iter().rev().map(confirmed).collect();
        let page_tokens: HashSet<ClientToken> =
            fresh.iter().filter_map(|m| m.client_token).collect();

        // Unconfirmed local entries and live arrivals survive the replacement.
        let carried: Vec<HistoryMessage> = self
            .messages
            .iter()
            .filter(|m| m.delivery.is_pending() || self.live_ids.contains(&m.id))
            .cloned()
            .collect();
        for m in carried {
            if let Some(temp_id) = m.delivery.temp_id() {
                if m.client_token.is_some_and(|t| page_tokens.contains(&t)) {
                    // Already persisted server-side; the page holds the confirmed copy.
                    self.outbox.remove(temp_id);
                    continue;
                }
            }
            if !fresh.contains(&m.id) {
                fresh.upsert(m);
            }
        }

        self.messages = fresh;
        self.live_ids.clear();
        self.cursor = Cursor {
            offset: 0,
            has_more_older: page.next && !empty,
            is_fetching_older: false,
        };
        self.load_state = LoadState::Ready;
        info!(
            "Loaded conversation {}: {} messages, has_more_older={}",
            self.conversation_id,
            self.messages.len(),
            self.cursor.has_more_older
        );
        Ok(TimelineChange::Replaced {
            count: self.messages.len(),
        })
    }

    fn apply_older(
        &mut self,
        request: HistoryRequest,
        result: Result<Page<HistoryMessage>, FetchError>,
    ) -> Result<TimelineChange, TimelineError> {
        self.cursor.is_fetching_older = false;
        match result {
            Ok(page) => {
                let empty = page.results.is_empty();
                let count = self
                    .messages
                    .prepend_unseen(page.results.into_iter().rev().map(confirmed));
                self.cursor.offset = request.offset;
                self.cursor.has_more_older = page.next && !empty;
                debug!(
                    "Older page at offset {} for conversation {}: {} new, has_more_older={}",
                    request.offset, self.conversation_id, count, self.cursor.has_more_older
                );
                Ok(TimelineChange::Prepended { count })
            }
            Err(e) => {
                warn!(
                    "Older page at offset {} for conversation {} failed: {}",
                    request.offset, self.conversation_id, e
                );
                self.older_error = Some(e.clone());
                Err(TimelineError::OlderPage(e))
            }
        }
    }

    // ─── Optimistic send ───────────────────────────────────────────────────

    pub fn send_text(&mut self, content: impl Into<String>) -> Result<SendTicket, TimelineError> {
        self.begin_send(OutgoingPayload::Text(content.into()))
    }

    pub fn send_image(&mut self, image: ImageFile) -> Result<SendTicket, TimelineError> {
        self.begin_send(OutgoingPayload::Image(image))
    }

    /// Appends a `Sending` entry for `payload` and returns the request to issue.
    pub fn begin_send(&mut self, payload: OutgoingPayload) -> Result<SendTicket, TimelineError> {
        let (content, media) = match &payload {
            OutgoingPayload::Text(text) => {
                if text.trim().is_empty() {
                    return Err(TimelineError::EmptyMessage);
                }
                (Some(text.clone()), None)
            }
            OutgoingPayload::Image(image) => {
                if image.data.is_empty() {
                    return Err(TimelineError::EmptyMessage);
                }
                let media = MediaRef {
                    url: format!("local://{}", image.file_name),
                    mime_type: Some(image.mime_type.clone()),
                    width: None,
                    height: None,
                };
                (None, Some(media))
            }
        };

        let temp_id = self.ids.next_id();
        let token = ClientToken::new();
        self.messages.upsert(HistoryMessage {
            id: temp_id,
            message_type: MessageType::User,
            content,
            media,
            created_at: self.clock.now(),
            sender_id: self.me,
            client_token: Some(token),
            delivery: DeliveryTag::Sending(temp_id),
        });
        self.outbox.insert(temp_id, token, payload.clone());
        debug!("Queued message {} in conversation {}", temp_id, self.conversation_id);

        Ok(SendTicket {
            conversation_id: self.conversation_id,
            epoch: self.epoch,
            temp_id,
            token,
            payload,
        })
    }

    /// Re-issues a failed send with its original payload and token.
    pub fn retry(&mut self, temp_id: MessageId) -> Result<SendTicket, TimelineError> {
        let slot = self
            .messages
            .get_mut(&temp_id)
            .ok_or(TimelineError::UnknownMessage(temp_id))?;
        let next = slot
            .delivery
            .apply(DeliveryTransition::Retry)
            .map_err(|_| TimelineError::NotRetryable(temp_id))?;
        let entry = self
            .outbox
            .get_mut(temp_id)
            .ok_or(TimelineError::UnknownMessage(temp_id))?;
        slot.delivery = next;
        entry.attempts += 1;
        entry.last_error = None;
        info!("Retrying message {} (attempt {})", temp_id, entry.attempts);

        Ok(SendTicket {
            conversation_id: self.conversation_id,
            epoch: self.epoch,
            temp_id,
            token: entry.token,
            payload: entry.payload.clone(),
        })
    }

    /// Applies the send endpoint's answer for `ticket`.
    pub fn apply_send(
        &mut self,
        ticket: &SendTicket,
        result: Result<ServerMessage, FetchError>,
    ) -> Result<TimelineChange, TimelineError> {
        if ticket.conversation_id != self.conversation_id || ticket.epoch != self.epoch {
            return Ok(TimelineChange::Ignored(IgnoreReason::Stale));
        }
        // Some(tag) while the slot still awaits confirmation.
        let confirm = self
            .messages
            .get(&ticket.temp_id)
            .and_then(|m| m.delivery.apply(DeliveryTransition::Confirm).ok());
        let slot_pending = confirm.is_some();

        match result {
            Ok(server) => {
                self.outbox.remove(ticket.temp_id);
                let mut server = confirmed(server);
                if server.client_token.is_none() {
                    server.client_token = Some(ticket.token);
                }
                let id = server.id;
                self.note_live(id);

                if let Some(tag) = confirm {
                    server.delivery = tag;
                    self.messages.replace_slot(&ticket.temp_id, server);
                    debug!("Message {} confirmed as {}", ticket.temp_id, id);
                    Ok(TimelineChange::Confirmed {
                        temp_id: ticket.temp_id,
                        id,
                    })
                } else if self.messages.contains(&id) {
                    // The echo got here first.
                    self.messages.upsert(server);
                    Ok(TimelineChange::Updated { id })
                } else {
                    self.messages.upsert(server);
                    Ok(TimelineChange::Appended {
                        id,
                        origin: AppendOrigin::Local,
                    })
                }
            }
            Err(e) => {
                if !slot_pending {
                    // Confirmed by an echo in the meantime.
                    self.outbox.remove(ticket.temp_id);
                    return Ok(TimelineChange::Unchanged);
                }
                if let Some(slot) = self.messages.get_mut(&ticket.temp_id) {
                    if let Ok(next) = slot.delivery.apply(DeliveryTransition::Fail) {
                        slot.delivery = next;
                    }
                }
                if let Some(entry) = self.outbox.get_mut(ticket.temp_id) {
                    entry.last_error = Some(e.clone());
                }
                warn!("Sending message {} failed: {}", ticket.temp_id, e);
                Err(TimelineError::Send {
                    temp_id: ticket.temp_id,
                    source: e,
                })
            }
        }
    }

    // ─── Real-time merge ───────────────────────────────────────────────────

    /// Decodes and merges one raw payload.
    pub fn merge_raw(&mut self, raw: &str) -> Result<TimelineChange, RealtimeDecodeError> {
        let event = decode_event(raw)?;
        Ok(self.merge_realtime(event))
    }

    /// Merges a pushed event. Real-time messages are always the newest, so new
    /// entries go to the end.
    pub fn merge_realtime(&mut self, event: RealtimeEvent) -> TimelineChange {
        if event.chat_id != self.conversation_id {
            return TimelineChange::Ignored(IgnoreReason::WrongConversation);
        }
        let message = match (event.kind, event.message) {
            (EventKind::User, Some(message)) => confirmed(message),
            _ => return TimelineChange::Ignored(IgnoreReason::NotUserMessage),
        };
        let id = message.id;

        if self.messages.contains(&id) {
            // Keep the client token from the confirmed copy.
            let token = self.messages.get(&id).and_then(|m| m.client_token);
            let mut message = message;
            message.client_token = message.client_token.or(token);
            self.messages.upsert(message);
            return TimelineChange::Updated { id };
        }

        if let Some((temp_id, tag)) = self.matching_slot(&message) {
            let mut message = message;
            message.delivery = tag;
            self.outbox.remove(temp_id);
            self.messages.replace_slot(&temp_id, message);
            self.note_live(id);
            debug!("Echo {} reconciled with pending {}", id, temp_id);
            return TimelineChange::Confirmed { temp_id, id };
        }

        self.note_live(id);
        self.messages.upsert(message);
        TimelineChange::Appended {
            id,
            origin: AppendOrigin::Remote,
        }
    }

    /// Pending slot that `echo` confirms, with its confirmed tag: by client token,
    /// or for tokenless own messages the oldest sending slot with identical text.
    fn matching_slot(&self, echo: &HistoryMessage) -> Option<(MessageId, DeliveryTag)> {
        let slot = if let Some(token) = echo.client_token {
            let temp_id = self.outbox.temp_id_for(&token)?;
            self.messages.get(&temp_id)?
        } else {
            if echo.sender_id != self.me || echo.content.is_none() {
                return None;
            }
            self.messages.iter().find(|m| {
                matches!(m.delivery, DeliveryTag::Sending(_)) && m.content == echo.content
            })?
        };
        let tag = slot.delivery.apply(DeliveryTransition::Confirm).ok()?;
        Some((slot.id, tag))
    }

    /// Confirmed ids seen while the initial load is in flight survive the page
    /// replacement.
    fn note_live(&mut self, id: MessageId) {
        if self.load_state == LoadState::Loading {
            self.live_ids.insert(id);
        }
    }
}

/// Marks a server-provided message as delivered.
fn confirmed(mut message: HistoryMessage) -> HistoryMessage {
    message.delivery = DeliveryTag::Sent;
    message
}
