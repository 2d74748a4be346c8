/// Inbox sync core
///
/// Client-side synchronization for a marketplace inbox: a paginated conversation
/// list, a per-conversation message timeline that merges history pages, real-time
/// events and optimistic sends, and scroll anchoring for the message viewport.

pub mod error;
pub mod config;
pub mod types;
pub mod ids;
pub mod merge;
pub mod delivery;
pub mod outbox;
pub mod feed;
pub mod timeline;
pub mod scroll;
pub mod api;
pub mod realtime;
pub mod session;
pub mod inbox;
pub mod wire;
pub mod http_client;
pub mod sandbox;
pub mod cli_app;

pub use error::{FetchError, InboxError, Result, TimelineError};
pub use config::Config;
pub use feed::ConversationFeed;
pub use timeline::MessageTimeline;
pub use scroll::ScrollAnchorController;
pub use session::{ConversationSession, SessionEvent, SessionHandle, TimelineView};
pub use inbox::Inbox;
