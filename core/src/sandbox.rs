/// In-memory marketplace backend serving the inbox REST API + SSE.
///
/// Used by the `sandbox` binary for local development and by the integration
/// tests, which bind it to an ephemeral port.
///
/// Endpoints:
///   GET  /api/conversations                 ?limit=N&offset=N
///   GET  /api/conversations/:id
///   GET  /api/conversations/:id/messages    ?limit=N&offset=N  (newest first)
///   POST /api/conversations/:id/messages    body: {"content"|"image", "client_token"}
///   GET  /events                            ?channel=<key>  SSE stream of message events
///
/// Every request carries `x-participant-id`.
use crate::error::Result;
use crate::realtime::encode_message_event;
use crate::types::{
    ClientToken, ConversationId, ConversationSummary, HistoryMessage, MediaRef, MessageId,
    MessageType, Page, Participant, ParticipantId, TripMetadata,
};
use crate::wire::{sse_frame, SendMessageBody, PARTICIPANT_HEADER};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

const MAX_PAGE: usize = 100;

// ─── Backend ─────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("conversation not found")]
    NotFound,

    #[error("not a participant of this conversation")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),

    #[error("send temporarily unavailable")]
    Unavailable,
}

impl SandboxError {
    fn status(&self) -> StatusCode {
        match self {
            SandboxError::NotFound => StatusCode::NOT_FOUND,
            SandboxError::Forbidden => StatusCode::FORBIDDEN,
            SandboxError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SandboxError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// A published event: channel key plus JSON payload.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel: String,
    pub payload: String,
}

struct ConversationRecord {
    participants: Vec<ParticipantId>,
    trip: Option<TripMetadata>,
    created_at: DateTime<Utc>,
    /// Oldest first
    messages: Vec<HistoryMessage>,
    tokens: HashMap<ClientToken, MessageId>,
}

impl ConversationRecord {
    fn updated_at(&self) -> DateTime<Utc> {
        self.messages
            .last()
            .map_or(self.created_at, |m| m.created_at)
    }
}

#[derive(Default)]
struct State {
    participants: HashMap<ParticipantId, Participant>,
    conversations: BTreeMap<ConversationId, ConversationRecord>,
    next_conversation_id: u64,
    next_message_id: i64,
    fail_next_sends: usize,
    send_delay: Option<Duration>,
}

impl State {
    fn summary(&self, id: ConversationId, record: &ConversationRecord) -> ConversationSummary {
        ConversationSummary {
            id,
            participants: record
                .participants
                .iter()
                .map(|pid| {
                    self.participants.get(pid).cloned().unwrap_or(Participant {
                        id: *pid,
                        display_name: format!("Participant {}", pid),
                        photo_url: None,
                    })
                })
                .collect(),
            last_message: record.messages.last().map(HistoryMessage::summary),
            trip: record.trip.clone(),
            updated_at: record.updated_at(),
            unread_count: 0,
        }
    }

    fn member(&self, me: ParticipantId, id: ConversationId) -> std::result::Result<&ConversationRecord, SandboxError> {
        let record = self.conversations.get(&id).ok_or(SandboxError::NotFound)?;
        if !record.participants.contains(&me) {
            return Err(SandboxError::Forbidden);
        }
        Ok(record)
    }
}

pub struct Backend {
    state: RwLock<State>,
    events: broadcast::Sender<ChannelEvent>,
    channel_prefix: String,
}

impl Backend {
    pub fn new(channel_prefix: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: RwLock::new(State {
                next_conversation_id: 1,
                next_message_id: 1,
                ..State::default()
            }),
            events,
            channel_prefix: channel_prefix.into(),
        }
    }

    pub fn channel_key(&self, id: ConversationId) -> String {
        format!("{}{}", self.channel_prefix, id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn add_participant(&self, id: ParticipantId, display_name: &str) {
        let mut state = self.state.write().await;
        state.participants.insert(
            id,
            Participant {
                id,
                display_name: display_name.to_string(),
                photo_url: None,
            },
        );
    }

    pub async fn create_conversation(
        &self,
        participants: &[ParticipantId],
        trip: Option<TripMetadata>,
    ) -> ConversationId {
        let mut state = self.state.write().await;
        let id = ConversationId(state.next_conversation_id);
        state.next_conversation_id += 1;
        state.conversations.insert(
            id,
            ConversationRecord {
                participants: participants.to_vec(),
                trip,
                created_at: Utc::now(),
                messages: Vec::new(),
                tokens: HashMap::new(),
            },
        );
        id
    }

    /// Makes the next `n` sends fail with 503.
    pub async fn fail_next_sends(&self, n: usize) {
        self.state.write().await.fail_next_sends = n;
    }

    /// Delays send responses after the event was published.
    pub async fn delay_sends(&self, delay: Option<Duration>) {
        self.state.write().await.send_delay = delay;
    }

    pub async fn list_conversations(
        &self,
        me: ParticipantId,
        limit: usize,
        offset: usize,
    ) -> Page<ConversationSummary> {
        let state = self.state.read().await;
        let mut mine: Vec<(ConversationId, &ConversationRecord)> = state
            .conversations
            .iter()
            .filter(|(_, r)| r.participants.contains(&me))
            .map(|(id, r)| (*id, r))
            .collect();
        mine.sort_by(|a, b| b.1.updated_at().cmp(&a.1.updated_at()).then(b.0.cmp(&a.0)));
        let total = mine.len();
        let results = mine
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(id, r)| state.summary(id, r))
            .collect();
        Page::new(results, offset + limit < total)
    }

    pub async fn conversation(
        &self,
        me: ParticipantId,
        id: ConversationId,
    ) -> std::result::Result<ConversationSummary, SandboxError> {
        let state = self.state.read().await;
        let record = state.member(me, id)?;
        Ok(state.summary(id, record))
    }

    /// One page of history, newest first.
    pub async fn history(
        &self,
        me: ParticipantId,
        id: ConversationId,
        limit: usize,
        offset: usize,
    ) -> std::result::Result<Page<HistoryMessage>, SandboxError> {
        let state = self.state.read().await;
        let record = state.member(me, id)?;
        let results = record
            .messages
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(Page::new(results, offset + limit < record.messages.len()))
    }

    /// Stores a message and publishes it on the conversation's channel.
    ///
    /// A repeated `client_token` returns the stored message without publishing.
    pub async fn send(
        &self,
        me: ParticipantId,
        id: ConversationId,
        body: SendMessageBody,
    ) -> std::result::Result<HistoryMessage, SandboxError> {
        let (message, delay) = {
            let mut state = self.state.write().await;
            state.member(me, id)?;
            if state.fail_next_sends > 0 {
                state.fail_next_sends -= 1;
                warn!("Injected send failure in conversation {}", id);
                return Err(SandboxError::Unavailable);
            }
            if let Some(token) = body.client_token {
                let existing = state
                    .conversations
                    .get(&id)
                    .and_then(|r| r.tokens.get(&token).and_then(|mid| r.messages.iter().find(|m| m.id == *mid)))
                    .cloned();
                if let Some(existing) = existing {
                    debug!("Duplicate send {} in conversation {}", token, id);
                    return Ok(existing);
                }
            }

            let content = body.content.filter(|c| !c.trim().is_empty());
            let media = match &body.image {
                Some(upload) => {
                    let image = upload
                        .decode()
                        .map_err(|e| SandboxError::BadRequest(e.to_string()))?;
                    if image.data.is_empty() {
                        return Err(SandboxError::BadRequest("empty image".to_string()));
                    }
                    Some(image)
                }
                None => None,
            };
            if content.is_none() && media.is_none() {
                return Err(SandboxError::BadRequest("message has no content".to_string()));
            }

            let message_id = MessageId(state.next_message_id);
            state.next_message_id += 1;
            let message = HistoryMessage {
                id: message_id,
                message_type: MessageType::User,
                content,
                media: media.map(|image| MediaRef {
                    url: format!("/media/{}/{}", message_id, image.file_name),
                    mime_type: Some(image.mime_type),
                    width: None,
                    height: None,
                }),
                created_at: Utc::now(),
                sender_id: me,
                client_token: body.client_token,
                delivery: Default::default(),
            };
            let record = state.conversations.get_mut(&id).ok_or(SandboxError::NotFound)?;
            record.messages.push(message.clone());
            if let Some(token) = body.client_token {
                record.tokens.insert(token, message_id);
            }
            (message, state.send_delay)
        };

        self.publish(id, &message);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(message)
    }

    /// Inserts a message without going through the send path (seed data, system
    /// notices). Published only if `publish` is set.
    pub async fn insert_message(
        &self,
        id: ConversationId,
        sender_id: ParticipantId,
        message_type: MessageType,
        content: &str,
        created_at: DateTime<Utc>,
        publish: bool,
    ) -> Option<HistoryMessage> {
        let message = {
            let mut state = self.state.write().await;
            let message_id = MessageId(state.next_message_id);
            let record = state.conversations.get_mut(&id)?;
            let message = HistoryMessage {
                id: message_id,
                message_type,
                content: Some(content.to_string()),
                media: None,
                created_at,
                sender_id,
                client_token: None,
                delivery: Default::default(),
            };
            record.messages.push(message.clone());
            state.next_message_id += 1;
            message
        };
        if publish {
            self.publish(id, &message);
        }
        Some(message)
    }

    fn publish(&self, id: ConversationId, message: &HistoryMessage) {
        match encode_message_event(id, message) {
            Ok(payload) => {
                let _ = self.events.send(ChannelEvent {
                    channel: self.channel_key(id),
                    payload,
                });
            }
            Err(e) => error!("Encoding event for message {} failed: {}", message.id, e),
        }
    }

    /// Demo data: one guest, two hosts, three conversations.
    pub async fn seed_demo(&self) {
        let guest = ParticipantId(1);
        let maria = ParticipantId(2);
        let jon = ParticipantId(3);
        self.add_participant(guest, "Alex Guest").await;
        self.add_participant(maria, "Maria (host)").await;
        self.add_participant(jon, "Jon (host)").await;

        let start = Utc::now() - ChronoDuration::days(3);
        let lisbon = self
            .create_conversation(
                &[guest, maria],
                Some(TripMetadata {
                    listing_id: Some(4411),
                    listing_title: Some("Sunny loft in Alfama".to_string()),
                    location: Some("Lisbon".to_string()),
                    check_in: NaiveDate::from_ymd_opt(2026, 11, 2),
                    check_out: NaiveDate::from_ymd_opt(2026, 11, 6),
                }),
            )
            .await;
        for i in 0..45 {
            let sender = if i % 2 == 0 { guest } else { maria };
            let at = start + ChronoDuration::minutes(i * 7);
            self.insert_message(lisbon, sender, MessageType::User, &format!("Lisbon message #{}", i + 1), at, false)
                .await;
        }
        self.insert_message(
            lisbon,
            maria,
            MessageType::System,
            "Reservation confirmed",
            start + ChronoDuration::hours(6),
            false,
        )
        .await;

        let cabin = self
            .create_conversation(
                &[guest, jon],
                Some(TripMetadata {
                    listing_title: Some("Lake cabin".to_string()),
                    location: Some("Lake Tahoe".to_string()),
                    ..TripMetadata::default()
                }),
            )
            .await;
        self.insert_message(cabin, jon, MessageType::User, "Is the hot tub working?", start, false)
            .await;

        self.create_conversation(&[guest, maria, jon], None).await;
        info!("Seeded demo data");
    }
}

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok<T: Serialize>(value: &T) -> Resp {
    match serde_json::to_vec(value) {
        Ok(body) => json_resp(StatusCode::OK, body),
        Err(e) => json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn sandbox_err(e: SandboxError) -> Resp {
    json_err(e.status(), &e.to_string())
}

fn sse_resp(rx: broadcast::Receiver<ChannelEvent>, channel: String) -> Resp {
    // Sent immediately so the client knows the connection is live
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold((rx, channel), |(mut rx, channel)| async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.channel == channel => {
                    let frame = Frame::data(bytes::Bytes::from(sse_frame(&event.payload)));
                    return Some((Ok::<_, Infallible>(frame), (rx, channel)));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client on {} lagged {} events", channel, n);
                    continue;
                }
                Err(_) => return None,
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .body(BodyExt::boxed(StreamBody::new(first.chain(events))))
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}

/// Serves `backend` on `listener` until the task is dropped.
pub async fn serve(backend: Arc<Backend>, listener: TcpListener) -> Result<()> {
    info!("Sandbox API listening on http://{}", listener.local_addr()?);
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let backend = backend.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let backend = backend.clone();
                        async move { Ok::<_, Infallible>(handle(req, backend).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Client disconnects are normal for SSE
                        if !e.is_incomplete_message() {
                            error!("Sandbox connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Sandbox accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, backend: Arc<Backend>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let Some(me) = req
        .headers()
        .get(PARTICIPANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(ParticipantId)
    else {
        return json_err(StatusCode::UNAUTHORIZED, "missing x-participant-id");
    };

    if method == Method::GET && path == "/events" {
        return match query_param(&query, "channel") {
            Some(channel) => sse_resp(backend.subscribe_events(), channel),
            None => json_err(StatusCode::BAD_REQUEST, "missing channel"),
        };
    }
    if method == Method::GET && path == "/api/conversations" {
        let (limit, offset) = paging(&query);
        return json_ok(&backend.list_conversations(me, limit, offset).await);
    }

    let Some(rest) = path.strip_prefix("/api/conversations/") else {
        return json_err(StatusCode::NOT_FOUND, "not found");
    };
    let (id, tail) = match rest.split_once('/') {
        Some((id, tail)) => (id, Some(tail)),
        None => (rest, None),
    };
    let Ok(id) = id.parse::<u64>().map(ConversationId) else {
        return json_err(StatusCode::NOT_FOUND, "not found");
    };

    match (method, tail) {
        (Method::GET, None) => match backend.conversation(me, id).await {
            Ok(summary) => json_ok(&summary),
            Err(e) => sandbox_err(e),
        },
        (Method::GET, Some("messages")) => {
            let (limit, offset) = paging(&query);
            match backend.history(me, id, limit, offset).await {
                Ok(page) => json_ok(&page),
                Err(e) => sandbox_err(e),
            }
        }
        (Method::POST, Some("messages")) => post_message(req, me, id, &backend).await,
        _ => json_err(StatusCode::NOT_FOUND, "not found"),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn post_message(
    req: Request<hyper::body::Incoming>,
    me: ParticipantId,
    id: ConversationId,
    backend: &Backend,
) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let body: SendMessageBody = match serde_json::from_slice(&body) {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    match backend.send(me, id, body).await {
        Ok(message) => json_ok(&message),
        Err(e) => sandbox_err(e),
    }
}

// ─── Utilities ───────────────────────────────────────────────────────────────

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

fn query_param(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return urlencoding::decode(v).ok().map(|v| v.into_owned());
            }
        }
    }
    None
}

fn paging(query: &str) -> (usize, usize) {
    let limit = query_param(query, "limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20usize)
        .clamp(1, MAX_PAGE);
    let offset = query_param(query, "offset")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    (limit, offset)
}
