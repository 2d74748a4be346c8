/// Inbox orchestrator: the conversation feed plus at most one open session
use crate::api::{ConversationApi, RealtimeTransport};
use crate::config::Config;
use crate::error::{FetchError, Result};
use crate::feed::{ConversationFeed, FeedChange};
use crate::ids::{Clock, SystemClock, TempIdGenerator};
use crate::session::{with_timeout, ConversationSession, SessionHandle, SessionOptions};
use crate::types::{ConversationId, ConversationSummary};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Inbox<A: ConversationApi, R: RealtimeTransport> {
    api: Arc<A>,
    transport: Arc<R>,
    config: Config,
    feed: ConversationFeed,
    ids: TempIdGenerator,
    clock: Arc<dyn Clock>,
    active: Option<(ConversationSummary, SessionHandle)>,
}

impl<A: ConversationApi, R: RealtimeTransport> Inbox<A, R> {
    pub fn new(api: Arc<A>, transport: Arc<R>, config: Config) -> Self {
        Self::with_clock(api, transport, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        api: Arc<A>,
        transport: Arc<R>,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let feed = ConversationFeed::new(config.feed_page_size);
        Self {
            api,
            transport,
            config,
            feed,
            ids: TempIdGenerator::new(),
            clock,
            active: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn feed(&self) -> &ConversationFeed {
        &self.feed
    }

    /// Loads the next page of the conversation list.
    pub async fn load_more_conversations(&mut self) -> std::result::Result<FeedChange, FetchError> {
        let Some(request) = self.feed.begin_next_page() else {
            return Ok(FeedChange::Skipped);
        };
        let result = with_timeout(
            self.config.request_timeout,
            self.api.fetch_conversations(request.limit, request.offset),
        )
        .await;
        self.feed.apply_page(request, result)
    }

    /// Drops the list and loads the first page again.
    pub async fn refresh_conversations(&mut self) -> std::result::Result<FeedChange, FetchError> {
        self.feed.reset();
        self.load_more_conversations().await
    }

    /// Opens `id`, closing whichever conversation was open before.
    ///
    /// The summary comes from the loaded feed when possible and is fetched
    /// otherwise.
    pub async fn open_conversation(&mut self, id: ConversationId) -> Result<SessionHandle> {
        let summary = match self.feed.find_local(id) {
            Some(summary) => summary.clone(),
            None => {
                debug!("Conversation {} not in feed, fetching", id);
                with_timeout(self.config.request_timeout, self.api.fetch_conversation(id)).await?
            }
        };

        self.close_active();

        let mut options = SessionOptions::from_config(&self.config, id);
        options.ids = self.ids.clone();
        options.clock = self.clock.clone();
        let handle = ConversationSession::open(self.api.clone(), self.transport.as_ref(), id, options);
        info!("Active conversation is now {}", id);
        self.active = Some((summary, handle.clone()));
        Ok(handle)
    }

    pub fn active_session(&self) -> Option<&SessionHandle> {
        self.active.as_ref().map(|(_, handle)| handle)
    }

    pub fn active_conversation(&self) -> Option<&ConversationSummary> {
        self.active.as_ref().map(|(summary, _)| summary)
    }

    pub fn close_active(&mut self) {
        if let Some((summary, handle)) = self.active.take() {
            debug!("Closing conversation {}", summary.id);
            handle.close();
        }
    }

    /// Copies the open conversation's newest message into its feed row.
    /// Returns `false` if nothing was updated.
    pub fn sync_preview(&mut self) -> bool {
        let Some((summary, handle)) = &self.active else {
            return false;
        };
        let view = handle.snapshot();
        let Some(last) = view.messages.iter().rev().find(|m| m.id.is_confirmed()) else {
            return false;
        };
        self.feed.record_activity(summary.id, last.summary())
    }
}

impl<A: ConversationApi, R: RealtimeTransport> Drop for Inbox<A, R> {
    fn drop(&mut self) {
        self.close_active();
    }
}
