/// Session integration tests
/// Drive a real session task against a scripted API and the in-process hub

extern crate inbox_core;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use inbox_core::api::ConversationApi;
use inbox_core::config::Config;
use inbox_core::error::{FetchError, InboxError, TimelineError};
use inbox_core::realtime::{encode_message_event, LocalRealtimeHub};
use inbox_core::scroll::{ScrollCommand, ScrollMetrics};
use inbox_core::session::{ConversationSession, SessionEvent, SessionHandle, SessionOptions, TimelineView};
use inbox_core::timeline::{LoadState, TimelineChange};
use inbox_core::types::{
    ClientToken, ConversationId, ConversationSummary, DeliveryTag, HistoryMessage, ImageFile,
    MessageId, MessageType, OutgoingPayload, Page, Participant, ParticipantId, ServerMessage,
};
use inbox_core::Inbox;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const CONV: ConversationId = ConversationId(12);
const ME: ParticipantId = ParticipantId(1);
const HOST: ParticipantId = ParticipantId(2);
const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
enum SendPlan {
    /// Respond, then publish the echo
    Ok,
    /// Publish the echo, then respond after a delay
    EchoFirst(Duration),
    Fail(FetchError),
    /// Never respond
    Hang,
}

struct FakeApi {
    hub: LocalRealtimeHub,
    history: Mutex<Vec<HistoryMessage>>,
    history_offsets: Mutex<Vec<usize>>,
    history_delay: Mutex<Duration>,
    history_failures: AtomicUsize,
    conversation_fetches: AtomicUsize,
    send_plans: Mutex<VecDeque<SendPlan>>,
    sent: Mutex<Vec<(OutgoingPayload, ClientToken)>>,
    next_id: AtomicI64,
}

impl FakeApi {
    fn new(hub: LocalRealtimeHub) -> Self {
        Self {
            hub,
            history: Mutex::new(Vec::new()),
            history_offsets: Mutex::new(Vec::new()),
            history_delay: Mutex::new(Duration::ZERO),
            history_failures: AtomicUsize::new(0),
            conversation_fetches: AtomicUsize::new(0),
            send_plans: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
        }
    }

    /// Server history with ids `1..=n` from the host, oldest first.
    fn with_history(self, n: i64) -> Self {
        *self.history.lock().unwrap() = (1..=n).map(|id| message(id, HOST, &format!("m{}", id))).collect();
        self
    }

    fn plan_sends(&self, plans: impl IntoIterator<Item = SendPlan>) {
        self.send_plans.lock().unwrap().extend(plans);
    }

    fn offsets(&self) -> Vec<usize> {
        self.history_offsets.lock().unwrap().clone()
    }

    fn sent(&self) -> Vec<(OutgoingPayload, ClientToken)> {
        self.sent.lock().unwrap().clone()
    }

    fn echo(&self, chat: ConversationId, message: &HistoryMessage) {
        let payload = encode_message_event(chat, message).unwrap();
        self.hub.publish(&format!("chat-{}", chat), payload);
    }

    async fn send(
        &self,
        id: ConversationId,
        payload: OutgoingPayload,
        token: ClientToken,
    ) -> Result<ServerMessage, FetchError> {
        let plan = self.send_plans.lock().unwrap().pop_front().unwrap_or(SendPlan::Ok);
        self.sent.lock().unwrap().push((payload.clone(), token));

        let mut stored = message(self.next_id.fetch_add(1, Ordering::SeqCst), ME, "");
        stored.content = payload.text().map(str::to_string);
        stored.client_token = Some(token);

        match plan {
            SendPlan::Ok => {
                self.history.lock().unwrap().push(stored.clone());
                self.echo(id, &stored);
                Ok(stored)
            }
            SendPlan::EchoFirst(delay) => {
                self.history.lock().unwrap().push(stored.clone());
                self.echo(id, &stored);
                sleep(delay).await;
                Ok(stored)
            }
            SendPlan::Fail(e) => Err(e),
            SendPlan::Hang => {
                std::future::pending::<()>().await;
                Err(FetchError::Closed)
            }
        }
    }
}

impl ConversationApi for FakeApi {
    async fn fetch_conversations(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Page<ConversationSummary>, FetchError> {
        let all = vec![summary(CONV), summary(ConversationId(13))];
        let results: Vec<_> = all.iter().skip(offset).take(limit).cloned().collect();
        Ok(Page::new(results, offset + limit < all.len()))
    }

    async fn fetch_conversation(&self, id: ConversationId) -> Result<ConversationSummary, FetchError> {
        self.conversation_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(summary(id))
    }

    async fn fetch_conversation_history(
        &self,
        _id: ConversationId,
        limit: usize,
        offset: usize,
    ) -> Result<Page<HistoryMessage>, FetchError> {
        self.history_offsets.lock().unwrap().push(offset);
        let delay = *self.history_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let fail = self
            .history_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(FetchError::Http {
                status: 500,
                body: "boom".to_string(),
            });
        }
        let history = self.history.lock().unwrap();
        let results: Vec<_> = history.iter().rev().skip(offset).take(limit).cloned().collect();
        Ok(Page::new(results, offset + limit < history.len()))
    }

    async fn send_text_message(
        &self,
        id: ConversationId,
        content: &str,
        token: ClientToken,
    ) -> Result<ServerMessage, FetchError> {
        self.send(id, OutgoingPayload::Text(content.to_string()), token).await
    }

    async fn send_image_message(
        &self,
        id: ConversationId,
        image: &ImageFile,
        token: ClientToken,
    ) -> Result<ServerMessage, FetchError> {
        self.send(id, OutgoingPayload::Image(image.clone()), token).await
    }
}

fn message(id: i64, sender: ParticipantId, content: &str) -> HistoryMessage {
    HistoryMessage {
        id: MessageId(id),
        message_type: MessageType::User,
        content: Some(content.to_string()),
        media: None,
        created_at: Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap() + ChronoDuration::seconds(id),
        sender_id: sender,
        client_token: None,
        delivery: DeliveryTag::Sent,
    }
}

fn summary(id: ConversationId) -> ConversationSummary {
    ConversationSummary {
        id,
        participants: vec![
            Participant {
                id: ME,
                display_name: "Guest".to_string(),
                photo_url: None,
            },
            Participant {
                id: HOST,
                display_name: "Host".to_string(),
                photo_url: None,
            },
        ],
        last_message: None,
        trip: None,
        updated_at: Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap(),
        unread_count: 0,
    }
}

fn options() -> SessionOptions {
    let config = Config {
        history_page_size: 20,
        request_timeout: Duration::from_millis(500),
        ..Config::default()
    };
    SessionOptions::from_config(&config, CONV)
}

fn open(api: &Arc<FakeApi>, hub: &LocalRealtimeHub) -> SessionHandle {
    ConversationSession::open(api.clone(), hub, CONV, options())
}

async fn until(session: &SessionHandle, ready: impl FnMut(&TimelineView) -> bool) -> TimelineView {
    timeout(WAIT, session.wait_until(ready))
        .await
        .expect("timed out waiting for view")
        .unwrap()
}

async fn ready(session: &SessionHandle) -> TimelineView {
    until(session, |v| v.is_ready()).await
}

/// Lets the session task work through queued commands.
async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

fn ids(view: &TimelineView) -> Vec<i64> {
    view.messages.iter().map(|m| m.id.0).collect()
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn setup(history: i64) -> (Arc<FakeApi>, LocalRealtimeHub) {
    let hub = LocalRealtimeHub::new();
    let api = Arc::new(FakeApi::new(hub.clone()).with_history(history));
    (api, hub)
}

#[tokio::test]
async fn test_open_empty_conversation() {
    let (api, hub) = setup(0);
    let session = open(&api, &hub);
    let view = ready(&session).await;
    assert!(view.messages.is_empty());
    assert!(!view.older.has_more);
    assert_eq!(api.offsets(), vec![0]);
}

#[tokio::test]
async fn test_backward_pagination_prepends_older_page() {
    let (api, hub) = setup(40);
    let session = open(&api, &hub);
    let view = ready(&session).await;
    assert_eq!(ids(&view), (21..=40).collect::<Vec<_>>());
    assert!(view.older.has_more);

    session.load_older().unwrap();
    let view = until(&session, |v| v.messages.len() == 40).await;
    assert_eq!(ids(&view), (1..=40).collect::<Vec<_>>());
    assert!(!view.older.has_more);
    assert_eq!(api.offsets(), vec![0, 20]);
}

#[tokio::test]
async fn test_send_with_echo_yields_one_entry() {
    let (api, hub) = setup(3);
    let session = open(&api, &hub);
    ready(&session).await;
    let mut events = session.subscribe();

    let temp_id = session.send_text("Hello").await.unwrap();
    assert!(temp_id.is_temporary());

    until(&session, |v| v.message(temp_id).is_none()).await;
    // Give the echo time to land too.
    settle().await;
    let view = session.snapshot();
    assert_eq!(view.messages.len(), 4);

    let last = view.messages.last().unwrap();
    assert!(last.id.is_confirmed());
    assert_eq!(last.delivery, DeliveryTag::Sent);
    assert_eq!(last.content.as_deref(), Some("Hello"));
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::Changed(TimelineChange::Confirmed { temp_id: t, .. }) if *t == temp_id
    )));
}

#[tokio::test]
async fn test_echo_before_response_yields_one_entry() {
    let (api, hub) = setup(3);
    api.plan_sends([SendPlan::EchoFirst(Duration::from_millis(100))]);
    let session = open(&api, &hub);
    ready(&session).await;

    let temp_id = session.send_text("quick").await.unwrap();
    let view = until(&session, |v| v.message(temp_id).is_none()).await;
    assert_eq!(view.messages.len(), 4);

    // The HTTP response arrives afterwards and must not add anything.
    sleep(Duration::from_millis(200)).await;
    let view = session.snapshot();
    assert_eq!(view.messages.len(), 4);
    assert_eq!(view.messages.iter().filter(|m| m.content.as_deref() == Some("quick")).count(), 1);
}

#[tokio::test]
async fn test_failed_send_then_retry() {
    let (api, hub) = setup(2);
    api.plan_sends([SendPlan::Fail(FetchError::Network("offline".into())), SendPlan::Ok]);
    let session = open(&api, &hub);
    ready(&session).await;
    let mut events = session.subscribe();

    let temp_id = session.send_text("Are you there?").await.unwrap();
    let view = until(&session, |v| {
        v.message(temp_id).is_some_and(|m| m.delivery == DeliveryTag::Error(temp_id))
    })
    .await;
    assert_eq!(view.messages.len(), 3);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SessionEvent::Error(TimelineError::Send { temp_id: t, .. }) if *t == temp_id
    )));

    session.retry(temp_id).await.unwrap();
    let view = until(&session, |v| v.message(temp_id).is_none()).await;
    settle().await;
    assert_eq!(session.snapshot().messages.len(), 3);
    assert_eq!(view.messages.last().unwrap().content.as_deref(), Some("Are you there?"));

    let sent = api.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
}

#[tokio::test]
async fn test_retry_of_confirmed_message_is_rejected() {
    let (api, hub) = setup(0);
    let session = open(&api, &hub);
    ready(&session).await;
    let temp_id = session.send_text("hi").await.unwrap();
    until(&session, |v| v.message(temp_id).is_none()).await;

    let err = session.retry(temp_id).await.unwrap_err();
    assert!(matches!(err, InboxError::Timeline(TimelineError::UnknownMessage(_))));
    let err = session.send_text("  ").await.unwrap_err();
    assert!(matches!(err, InboxError::Timeline(TimelineError::EmptyMessage)));
}

#[tokio::test]
async fn test_new_message_while_reading_history_shows_indicator() {
    let (api, hub) = setup(5);
    let session = open(&api, &hub);
    ready(&session).await;
    session
        .report_viewport(ScrollMetrics::new(0.0, 5000.0, 600.0))
        .unwrap();
    settle().await;
    let mut events = session.subscribe();

    api.echo(CONV, &message(6, HOST, "new"));
    let view = until(&session, |v| v.messages.len() == 6).await;
    assert_eq!(view.unseen_count, 1);
    assert_eq!(view.messages.last().unwrap().id, MessageId(6));
    assert!(!drain(&mut events).iter().any(|e| matches!(e, SessionEvent::Scroll(_))));

    session
        .report_viewport(ScrollMetrics::new(4400.0, 5000.0, 600.0))
        .unwrap();
    until(&session, |v| v.unseen_count == 0).await;
}

#[tokio::test]
async fn test_new_message_at_bottom_scrolls() {
    let (api, hub) = setup(5);
    let session = open(&api, &hub);
    ready(&session).await;
    session
        .report_viewport(ScrollMetrics::new(1400.0, 2000.0, 600.0))
        .unwrap();
    settle().await;
    let mut events = session.subscribe();

    api.echo(CONV, &message(6, HOST, "new"));
    let view = until(&session, |v| v.messages.len() == 6).await;
    assert_eq!(view.unseen_count, 0);
    assert!(drain(&mut events)
        .contains(&SessionEvent::Scroll(ScrollCommand::ScrollToBottom { smooth: true })));
}

#[tokio::test]
async fn test_prepend_restores_scroll_position() {
    let (api, hub) = setup(40);
    let session = open(&api, &hub);
    ready(&session).await;
    session
        .report_viewport(ScrollMetrics::new(0.0, 1000.0, 600.0))
        .unwrap();
    let mut events = session.subscribe();

    session.load_older().unwrap();
    until(&session, |v| v.messages.len() == 40).await;
    session
        .report_layout(ScrollMetrics::new(0.0, 1960.0, 600.0))
        .unwrap();
    settle().await;
    assert!(drain(&mut events).contains(&SessionEvent::Scroll(ScrollCommand::SetScrollTop(960.0))));
}

#[tokio::test]
async fn test_rapid_load_older_fetches_once() {
    let (api, hub) = setup(60);
    let session = open(&api, &hub);
    ready(&session).await;
    *api.history_delay.lock().unwrap() = Duration::from_millis(50);

    session.load_older().unwrap();
    session.load_older().unwrap();
    session.load_older().unwrap();
    until(&session, |v| v.messages.len() == 40 && !v.older.is_fetching).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(api.offsets(), vec![0, 20]);
}

#[tokio::test]
async fn test_initial_failure_and_reload() {
    let (api, hub) = setup(3);
    api.history_failures.store(1, Ordering::SeqCst);
    let session = open(&api, &hub);
    let view = until(&session, |v| matches!(v.load_state, LoadState::Failed(_))).await;
    assert!(view.messages.is_empty());

    session.reload().unwrap();
    let view = ready(&session).await;
    assert_eq!(ids(&view), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_older_failure_keeps_messages() {
    let (api, hub) = setup(30);
    let session = open(&api, &hub);
    ready(&session).await;
    api.history_failures.store(1, Ordering::SeqCst);

    session.load_older().unwrap();
    let view = until(&session, |v| v.older.error.is_some()).await;
    assert_eq!(view.messages.len(), 20);
    assert!(view.older.has_more);

    session.load_older().unwrap();
    let view = until(&session, |v| v.messages.len() == 30).await;
    assert!(view.older.error.is_none());
}

#[tokio::test]
async fn test_slow_history_times_out() {
    let (api, hub) = setup(3);
    *api.history_delay.lock().unwrap() = Duration::from_secs(5);
    let session = open(&api, &hub);
    let view = until(&session, |v| matches!(v.load_state, LoadState::Failed(_))).await;
    assert_eq!(view.load_state, LoadState::Failed(FetchError::Timeout(Duration::from_millis(500))));
}

#[tokio::test]
async fn test_foreign_and_malformed_events_are_ignored() {
    let (api, hub) = setup(2);
    let session = open(&api, &hub);
    ready(&session).await;

    hub.publish("chat-12", "{not json");
    api.echo(ConversationId(99), &message(3, HOST, "elsewhere"));
    let foreign = encode_message_event(ConversationId(99), &message(4, HOST, "wrong channel")).unwrap();
    hub.publish("chat-12", foreign);
    api.echo(CONV, &message(5, HOST, "here"));

    let view = until(&session, |v| v.messages.len() == 3).await;
    assert_eq!(ids(&view), vec![1, 2, 5]);
}

#[tokio::test]
async fn test_close_unsubscribes_and_discards_late_results() {
    let (api, hub) = setup(2);
    api.plan_sends([SendPlan::Hang]);
    let session = open(&api, &hub);
    ready(&session).await;
    assert_eq!(hub.subscriber_count("chat-12"), 1);
    session.send_text("never confirmed").await.unwrap();

    let other = session.clone();
    session.close();
    assert!(other.is_closed());
    assert_eq!(hub.subscriber_count("chat-12"), 0);
    assert!(matches!(session.load_older(), Err(InboxError::Session(_))));
    assert!(matches!(session.send_text("x").await, Err(InboxError::Session(_))));
}

#[tokio::test]
async fn test_dropping_last_handle_unsubscribes() {
    let (api, hub) = setup(0);
    let session = open(&api, &hub);
    ready(&session).await;
    drop(session);
    assert_eq!(hub.subscriber_count("chat-12"), 0);
}

#[tokio::test]
async fn test_image_send_keeps_file_for_retry() {
    let (api, hub) = setup(0);
    api.plan_sends([SendPlan::Fail(FetchError::Http { status: 503, body: String::new() })]);
    let session = open(&api, &hub);
    ready(&session).await;

    let image = ImageFile::new("porch.jpg", "image/jpeg", vec![7u8; 16]);
    let temp_id = session.send_image(image.clone()).await.unwrap();
    until(&session, |v| v.message(temp_id).is_some_and(|m| m.delivery == DeliveryTag::Error(temp_id))).await;
    session.retry(temp_id).await.unwrap();
    until(&session, |v| v.message(temp_id).is_none()).await;

    let sent = api.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].0, OutgoingPayload::Image(image));
}

#[tokio::test]
async fn test_inbox_opens_from_feed_and_switches_sessions() {
    let hub = LocalRealtimeHub::new();
    let api = Arc::new(FakeApi::new(hub.clone()).with_history(2));
    let mut inbox = Inbox::new(api.clone(), Arc::new(hub.clone()), Config::default());

    inbox.load_more_conversations().await.unwrap();
    assert_eq!(inbox.feed().len(), 2);

    let first = inbox.open_conversation(CONV).await.unwrap();
    assert_eq!(api.conversation_fetches.load(Ordering::SeqCst), 0);
    assert_eq!(hub.subscriber_count("chat-12"), 1);

    let second = inbox.open_conversation(ConversationId(77)).await.unwrap();
    assert_eq!(api.conversation_fetches.load(Ordering::SeqCst), 1);
    assert!(first.is_closed());
    assert_eq!(hub.subscriber_count("chat-12"), 0);
    assert_eq!(hub.subscriber_count("chat-77"), 1);
    assert_eq!(inbox.active_conversation().unwrap().id, ConversationId(77));
    ready(&second).await;

    drop(inbox);
    assert_eq!(hub.subscriber_count("chat-77"), 0);
}

#[tokio::test]
async fn test_inbox_preview_follows_active_session() {
    let hub = LocalRealtimeHub::new();
    let api = Arc::new(FakeApi::new(hub.clone()).with_history(2));
    let mut inbox = Inbox::new(api.clone(), Arc::new(hub.clone()), Config::default());
    inbox.load_more_conversations().await.unwrap();
    let session = inbox.open_conversation(CONV).await.unwrap();
    ready(&session).await;

    api.echo(CONV, &message(3, HOST, "latest"));
    until(&session, |v| v.messages.len() == 3).await;
    assert!(inbox.sync_preview());
    let row = inbox.feed().find_local(CONV).unwrap();
    assert_eq!(row.last_message.as_ref().unwrap().content.as_deref(), Some("latest"));
}
