/// Paginated conversation list
use crate::api::ConversationApi;
use crate::error::FetchError;
use crate::merge::{KeyedVec, MergeStats};
use crate::types::{ConversationId, ConversationSummary, MessageSummary, Page};
use tracing::{debug, warn};

/// Ticket for one in-flight feed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedPageRequest {
    pub generation: u64,
    pub offset: usize,
    pub limit: usize,
}

/// What a feed operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedChange {
    /// A page was merged.
    Merged(MergeStats),
    /// Nothing to do: a fetch is already running or the list is exhausted.
    Skipped,
    /// The response belonged to a feed generation that no longer exists.
    Stale,
}

/// Scrollable list of conversations, loaded page by page.
///
/// Ordering is whatever the server returned (most recent first); merges never
/// re-sort.
#[derive(Debug)]
pub struct ConversationFeed {
    items: KeyedVec<ConversationSummary>,
    page_size: usize,
    offset: usize,
    has_more: bool,
    in_flight: Option<FeedPageRequest>,
    generation: u64,
    last_error: Option<FetchError>,
}

impl ConversationFeed {
    pub fn new(page_size: usize) -> Self {
        Self {
            items: KeyedVec::new(),
            page_size: page_size.max(1),
            offset: 0,
            has_more: true,
            in_flight: None,
            generation: 0,
            last_error: None,
        }
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        self.items.as_slice()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.last_error.as_ref()
    }

    /// O(1) lookup of an already loaded conversation.
    pub fn find_local(&self, id: ConversationId) -> Option<&ConversationSummary> {
        self.items.get(&id)
    }

    /// Claims the next page. Returns `None` while a page is in flight or once
    /// the server reported the end of the list.
    pub fn begin_next_page(&mut self) -> Option<FeedPageRequest> {
        if self.in_flight.is_some() || !self.has_more {
            return None;
        }
        let request = FeedPageRequest {
            generation: self.generation,
            offset: self.offset,
            limit: self.page_size,
        };
        self.in_flight = Some(request);
        Some(request)
    }

    /// Applies the outcome of a page claimed with [`begin_next_page`].
    ///
    /// On failure nothing but `last_error` changes, so the same page is fetched
    /// again on the next call.
    ///
    /// [`begin_next_page`]: ConversationFeed::begin_next_page
    pub fn apply_page(
        &mut self,
        request: FeedPageRequest,
        result: Result<Page<ConversationSummary>, FetchError>,
    ) -> Result<FeedChange, FetchError> {
        if request.generation != self.generation {
            debug!("Dropping stale feed page at offset {}", request.offset);
            return Ok(FeedChange::Stale);
        }
        if self.in_flight == Some(request) {
            self.in_flight = None;
        }

        match result {
            Ok(page) => {
                let empty = page.results.is_empty();
                let stats = self.items.upsert_all(page.results);
                self.offset = request.offset + request.limit;
                self.has_more = page.next && !empty;
                self.last_error = None;
                debug!(
                    "Feed page at offset {}: {} new, {} updated, has_more={}",
                    request.offset, stats.inserted, stats.updated, self.has_more
                );
                Ok(FeedChange::Merged(stats))
            }
            Err(e) => {
                warn!("Feed page at offset {} failed: {}", request.offset, e);
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Fetches and merges the next page.
    pub async fn load_next_page<A: ConversationApi>(
        &mut self,
        api: &A,
    ) -> Result<FeedChange, FetchError> {
        let Some(request) = self.begin_next_page() else {
            return Ok(FeedChange::Skipped);
        };
        let result = api.fetch_conversations(request.limit, request.offset).await;
        self.apply_page(request, result)
    }

    /// Drops everything and starts again from the first page.
    ///
    /// A page still in flight is discarded when it completes.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.items.clear();
        self.offset = 0;
        self.has_more = true;
        self.in_flight = None;
        self.last_error = None;
    }

    /// Updates a row's last-message preview in place. Returns `false` if the
    /// conversation is not loaded.
    pub fn record_activity(&mut self, id: ConversationId, last: MessageSummary) -> bool {
        let Some(row) = self.items.get_mut(&id) else {
            return false;
        };
        let newer = row
            .last_message
            .as_ref()
            .map_or(true, |current| current.created_at <= last.created_at);
        if newer {
            row.updated_at = last.created_at;
            row.last_message = Some(last);
        }
        true
    }
}
