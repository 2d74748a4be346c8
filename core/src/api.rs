/// Collaborator contracts consumed by the sync core.
///
/// The HTTP fetchers/senders and the real-time subscription live outside the core;
/// `http_client` provides the production implementation and tests use scripted
/// fakes.
use crate::error::FetchError;
use crate::types::{
    ClientToken, ConversationId, ConversationSummary, HistoryMessage, ImageFile, OutgoingPayload,
    Page, ServerMessage,
};
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::debug;

/// Conversation list, history and send endpoints.
pub trait ConversationApi: Send + Sync + 'static {
    /// One page of the conversation list, most recent first.
    fn fetch_conversations(
        &self,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Page<ConversationSummary>, FetchError>> + Send;

    fn fetch_conversation(
        &self,
        id: ConversationId,
    ) -> impl Future<Output = Result<ConversationSummary, FetchError>> + Send;

    /// One page of history, newest first. Offset 0 is the newest page.
    fn fetch_conversation_history(
        &self,
        id: ConversationId,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Page<HistoryMessage>, FetchError>> + Send;

    fn send_text_message(
        &self,
        id: ConversationId,
        content: &str,
        token: ClientToken,
    ) -> impl Future<Output = Result<ServerMessage, FetchError>> + Send;

    fn send_image_message(
        &self,
        id: ConversationId,
        image: &ImageFile,
        token: ClientToken,
    ) -> impl Future<Output = Result<ServerMessage, FetchError>> + Send;

    /// Dispatches a stored payload to the matching send endpoint.
    fn send_payload(
        &self,
        id: ConversationId,
        payload: &OutgoingPayload,
        token: ClientToken,
    ) -> impl Future<Output = Result<ServerMessage, FetchError>> + Send {
        async move {
            match payload {
                OutgoingPayload::Text(content) => self.send_text_message(id, content, token).await,
                OutgoingPayload::Image(image) => self.send_image_message(id, image, token).await,
            }
        }
    }
}

/// Push channel delivering raw JSON payloads for one conversation.
pub trait RealtimeTransport: Send + Sync + 'static {
    fn subscribe(&self, channel_key: &str) -> Result<RealtimeSubscription, FetchError>;
}

/// Unsubscribes from a real-time channel when dropped.
pub struct SubscriptionGuard {
    channel_key: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(channel_key: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            channel_key: channel_key.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn channel_key(&self) -> &str {
        &self.channel_key
    }

    /// Unsubscribes now. Equivalent to dropping the guard.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!("Unsubscribing from {}", self.channel_key);
            cancel();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("channel_key", &self.channel_key)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A live subscription: the payload stream plus the guard that ends it.
#[derive(Debug)]
pub struct RealtimeSubscription {
    pub events: mpsc::UnboundedReceiver<String>,
    pub guard: SubscriptionGuard,
}

impl RealtimeSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<String>, guard: SubscriptionGuard) -> Self {
        Self { events, guard }
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<String>, SubscriptionGuard) {
        (self.events, self.guard)
    }
}
