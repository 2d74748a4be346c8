/// One open conversation: timeline, real-time subscription and in-flight requests.
///
/// The session runs as a single tokio task. Every timeline mutation happens inside
/// its `select!` loop, so no locking is needed around the timeline itself. The
/// presentation layer talks to it through a [`SessionHandle`].
use crate::api::{ConversationApi, RealtimeTransport, SubscriptionGuard};
use crate::config::{Config, ScrollConfig};
use crate::error::{FetchError, InboxError, Result, TimelineError};
use crate::ids::{Clock, SystemClock, TempIdGenerator};
use crate::scroll::{AppendDecision, ScrollAnchorController, ScrollCommand, ScrollMetrics};
use crate::timeline::{
    AppendOrigin, HistoryKind, HistoryRequest, LoadState, MessageTimeline, SendTicket, TimelineChange,
};
use crate::types::{
    ConversationId, HistoryMessage, ImageFile, MessageId, OutgoingPayload, Page, ParticipantId,
    ServerMessage,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Backward pagination flags as shown to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OlderState {
    pub has_more: bool,
    pub is_fetching: bool,
    pub error: Option<FetchError>,
}

/// Snapshot of a session, published after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineView {
    pub conversation_id: ConversationId,
    pub messages: Vec<HistoryMessage>,
    pub load_state: LoadState,
    pub older: OlderState,
    /// "N new messages" indicator
    pub unseen_count: usize,
}

impl TimelineView {
    fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            load_state: LoadState::Idle,
            older: OlderState::default(),
            unseen_count: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.load_state == LoadState::Ready
    }

    pub fn message(&self, id: MessageId) -> Option<&HistoryMessage> {
        self.messages.iter().find(|m| m.id == id)
    }
}

/// Notifications for the renderer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Changed(TimelineChange),
    Scroll(ScrollCommand),
    Error(TimelineError),
}

/// Per-session settings.
#[derive(Clone)]
pub struct SessionOptions {
    pub me: ParticipantId,
    pub page_size: usize,
    pub request_timeout: Duration,
    pub channel_key: String,
    pub scroll: ScrollConfig,
    pub ids: TempIdGenerator,
    pub clock: Arc<dyn Clock>,
}

impl SessionOptions {
    pub fn from_config(config: &Config, conversation_id: ConversationId) -> Self {
        Self {
            me: config.participant_id,
            page_size: config.history_page_size,
            request_timeout: config.request_timeout,
            channel_key: config.channel_key(conversation_id),
            scroll: config.scroll,
            ids: TempIdGenerator::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

type Reply = oneshot::Sender<std::result::Result<MessageId, TimelineError>>;

enum Command {
    Send(OutgoingPayload, Reply),
    Retry(MessageId, Reply),
    LoadOlder,
    Reload,
    Viewport(ScrollMetrics),
    LaidOut(ScrollMetrics),
    JumpToBottom,
}

enum Completion {
    History(HistoryRequest, std::result::Result<Page<HistoryMessage>, FetchError>),
    Send(SendTicket, std::result::Result<ServerMessage, FetchError>),
}

struct Shared {
    conversation_id: ConversationId,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    view: watch::Receiver<TimelineView>,
    closed: AtomicBool,
    guard: Mutex<Option<SubscriptionGuard>>,
    task: Mutex<Option<AbortHandle>>,
}

impl Shared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let guard = self.guard.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(guard);
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        info!("Closed conversation {}", self.conversation_id);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to a running session. Clones share the session; it closes on
/// [`close`](SessionHandle::close) or when the last clone is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

pub struct ConversationSession;

impl ConversationSession {
    /// Subscribes to the conversation's channel, starts the initial load and
    /// returns the handle. Must be called inside a tokio runtime.
    ///
    /// A failed subscription is not fatal: the session works without pushes.
    pub fn open<A, R>(
        api: Arc<A>,
        transport: &R,
        conversation_id: ConversationId,
        options: SessionOptions,
    ) -> SessionHandle
    where
        A: ConversationApi,
        R: RealtimeTransport + ?Sized,
    {
        let (events_rx, guard) = match transport.subscribe(&options.channel_key) {
            Ok(sub) => {
                let (rx, guard) = sub.into_parts();
                (Some(rx), Some(guard))
            }
            Err(e) => {
                warn!("Subscribing to {} failed: {}", options.channel_key, e);
                (None, None)
            }
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(TimelineView::empty(conversation_id));
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            conversation_id,
            commands: commands_tx,
            events: events_tx.clone(),
            view: view_rx,
            closed: AtomicBool::new(false),
            guard: Mutex::new(guard),
            task: Mutex::new(None),
        });

        let timeline = MessageTimeline::with_parts(
            conversation_id,
            options.me,
            options.page_size,
            options.ids.clone(),
            options.clock.clone(),
        );
        let task = SessionTask {
            api,
            timeline,
            scroll: ScrollAnchorController::new(options.scroll),
            timeout: options.request_timeout,
            view_tx,
            events_tx,
            inflight: JoinSet::new(),
        };
        let handle = tokio::spawn(task.run(commands_rx, events_rx));
        *shared.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.abort_handle());

        info!("Opened conversation {}", conversation_id);
        SessionHandle { shared }
    }
}

impl SessionHandle {
    pub fn conversation_id(&self) -> ConversationId {
        self.shared.conversation_id
    }

    /// Sends a text message. Returns the temporary id of the optimistic entry.
    pub async fn send_text(&self, content: impl Into<String>) -> Result<MessageId> {
        self.request(|reply| Command::Send(OutgoingPayload::Text(content.into()), reply))
            .await
    }

    pub async fn send_image(&self, image: ImageFile) -> Result<MessageId> {
        self.request(|reply| Command::Send(OutgoingPayload::Image(image), reply))
            .await
    }

    /// Resends a failed message with its original payload.
    pub async fn retry(&self, temp_id: MessageId) -> Result<()> {
        self.request(|reply| Command::Retry(temp_id, reply)).await?;
        Ok(())
    }

    pub fn load_older(&self) -> Result<()> {
        self.command(Command::LoadOlder)
    }

    /// Reloads the newest page, e.g. after a failed initial load.
    pub fn reload(&self) -> Result<()> {
        self.command(Command::Reload)
    }

    /// Geometry after a user scroll.
    pub fn report_viewport(&self, metrics: ScrollMetrics) -> Result<()> {
        self.command(Command::Viewport(metrics))
    }

    /// Geometry after the renderer laid out new content.
    pub fn report_layout(&self, metrics: ScrollMetrics) -> Result<()> {
        self.command(Command::LaidOut(metrics))
    }

    pub fn jump_to_bottom(&self) -> Result<()> {
        self.command(Command::JumpToBottom)
    }

    pub fn view(&self) -> watch::Receiver<TimelineView> {
        self.shared.view.clone()
    }

    pub fn snapshot(&self) -> TimelineView {
        self.shared.view.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Waits until the published view satisfies `ready`.
    pub async fn wait_until(
        &self,
        ready: impl FnMut(&TimelineView) -> bool,
    ) -> Result<TimelineView> {
        let mut view = self.view();
        let snapshot = view
            .wait_for(ready)
            .await
            .map_err(|_| InboxError::Session("session closed".to_string()))?
            .clone();
        Ok(snapshot)
    }

    /// Unsubscribes, stops the session task and discards late results.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(closed());
        }
        self.shared.commands.send(command).map_err(|_| closed())
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<MessageId> {
        let (reply, rx) = oneshot::channel();
        self.command(build(reply))?;
        let temp_id = rx.await.map_err(|_| closed())??;
        Ok(temp_id)
    }
}

fn closed() -> InboxError {
    InboxError::Session("session closed".to_string())
}

/// Bounds a collaborator call; expiry maps to [`FetchError::Timeout`].
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = std::result::Result<T, FetchError>>,
) -> std::result::Result<T, FetchError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(limit)),
    }
}

struct SessionTask<A: ConversationApi> {
    api: Arc<A>,
    timeline: MessageTimeline,
    scroll: ScrollAnchorController,
    timeout: Duration,
    view_tx: watch::Sender<TimelineView>,
    events_tx: broadcast::Sender<SessionEvent>,
    inflight: JoinSet<Completion>,
}

impl<A: ConversationApi> SessionTask<A> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut realtime: Option<mpsc::UnboundedReceiver<String>>,
    ) {
        let request = self.timeline.begin_initial_load();
        self.spawn_history(request);
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    match joined {
                        Ok(completion) => self.on_completion(completion),
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => error!("Request task failed: {}", e),
                    }
                }
                payload = recv_payload(&mut realtime), if realtime.is_some() => match payload {
                    Some(raw) => self.on_payload(&raw),
                    None => {
                        warn!(
                            "Real-time channel for conversation {} closed",
                            self.timeline.conversation_id()
                        );
                        realtime = None;
                    }
                },
            }
        }

        self.inflight.abort_all();
        debug!("Session task for {} finished", self.timeline.conversation_id());
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send(payload, reply) => {
                let result = self.timeline.begin_send(payload);
                self.after_ticket(result, reply, |id| TimelineChange::Appended {
                    id,
                    origin: AppendOrigin::Local,
                });
            }
            Command::Retry(temp_id, reply) => {
                let result = self.timeline.retry(temp_id);
                self.after_ticket(result, reply, |id| TimelineChange::Updated { id });
            }
            Command::LoadOlder => {
                if let Some(request) = self.timeline.begin_load_older() {
                    self.spawn_history(request);
                    self.publish();
                }
            }
            Command::Reload => {
                let request = self.timeline.begin_initial_load();
                self.spawn_history(request);
                self.publish();
            }
            Command::Viewport(metrics) => {
                let unseen = self.scroll.unseen_count();
                self.scroll.on_viewport(metrics);
                if self.scroll.unseen_count() != unseen {
                    self.publish();
                }
            }
            Command::LaidOut(metrics) => {
                if self.scroll.has_pending_anchor() {
                    if let Some(command) = self.scroll.on_after_prepend(metrics.scroll_height) {
                        self.emit(SessionEvent::Scroll(command));
                    }
                } else {
                    self.scroll.on_viewport(metrics);
                }
            }
            Command::JumpToBottom => {
                let command = self.scroll.jump_to_bottom();
                self.publish();
                self.emit(SessionEvent::Scroll(command));
            }
        }
    }

    fn after_ticket(
        &mut self,
        result: std::result::Result<SendTicket, TimelineError>,
        reply: Reply,
        change: impl FnOnce(MessageId) -> TimelineChange,
    ) {
        match result {
            Ok(ticket) => {
                let temp_id = ticket.temp_id;
                self.spawn_send(ticket);
                self.on_change(change(temp_id));
                let _ = reply.send(Ok(temp_id));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::History(request, result) => {
                if request.kind == HistoryKind::Older
                    && result.as_ref().is_ok_and(|page| !page.results.is_empty())
                {
                    self.scroll.on_before_prepend();
                }
                match self.timeline.apply_history(request, result) {
                    Ok(change) => self.on_change(change),
                    Err(e) => self.on_error(e),
                }
            }
            Completion::Send(ticket, result) => match self.timeline.apply_send(&ticket, result) {
                Ok(change) => self.on_change(change),
                Err(e) => self.on_error(e),
            },
        }
    }

    fn on_payload(&mut self, raw: &str) {
        match self.timeline.merge_raw(raw) {
            Ok(change) => self.on_change(change),
            Err(e) => warn!("Dropping real-time payload: {}", e),
        }
    }

    fn on_change(&mut self, change: TimelineChange) {
        if matches!(change, TimelineChange::Ignored(_) | TimelineChange::Unchanged) {
            debug!("No-op change {:?}", change);
            return;
        }
        let scroll = match change.appended_count() {
            0 => None,
            n => match self.scroll.on_append(n) {
                AppendDecision::StickToBottom(command) => Some(command),
                AppendDecision::Indicate { unseen } => {
                    debug!("{} unseen messages", unseen);
                    None
                }
            },
        };
        self.publish();
        self.emit(SessionEvent::Changed(change));
        if let Some(command) = scroll {
            self.emit(SessionEvent::Scroll(command));
        }
    }

    fn on_error(&mut self, e: TimelineError) {
        self.publish();
        self.emit(SessionEvent::Error(e));
    }

    fn spawn_history(&mut self, request: HistoryRequest) {
        let api = self.api.clone();
        let limit = self.timeout;
        self.inflight.spawn(async move {
            let result = with_timeout(
                limit,
                api.fetch_conversation_history(request.conversation_id, request.limit, request.offset),
            )
            .await;
            Completion::History(request, result)
        });
    }

    fn spawn_send(&mut self, ticket: SendTicket) {
        let api = self.api.clone();
        let limit = self.timeout;
        self.inflight.spawn(async move {
            let result = with_timeout(
                limit,
                api.send_payload(ticket.conversation_id, &ticket.payload, ticket.token),
            )
            .await;
            Completion::Send(ticket, result)
        });
    }

    fn publish(&self) {
        let cursor = self.timeline.cursor();
        let view = TimelineView {
            conversation_id: self.timeline.conversation_id(),
            messages: self.timeline.messages().to_vec(),
            load_state: self.timeline.load_state().clone(),
            older: OlderState {
                has_more: cursor.has_more_older,
                is_fetching: cursor.is_fetching_older,
                error: self.timeline.older_error().cloned(),
            },
            unseen_count: self.scroll.unseen_count(),
        };
        self.view_tx.send_replace(view);
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events_tx.send(event);
    }
}

async fn recv_payload(realtime: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match realtime {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
