/// Configuration management
use crate::error::{InboxError, Result};
use crate::types::ParticipantId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8700";
const DEFAULT_PAGE_SIZE: usize = 20;

/// Scroll thresholds used to decide between sticking to the bottom and showing
/// the "new messages" indicator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollConfig {
    /// Maximum `gap / scrollable_height` still considered "at the bottom"
    pub stick_ratio: f64,

    /// Maximum absolute gap in pixels still considered "at the bottom"
    pub stick_max_gap_px: f64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            stick_ratio: 0.15,
            stick_max_gap_px: 200.0,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the marketplace API
    pub api_url: String,

    /// Participant this client acts as
    pub participant_id: ParticipantId,

    /// Optional bearer token sent with every request
    pub api_token: Option<String>,

    /// Conversations per feed page
    pub feed_page_size: usize,

    /// Messages per history page
    pub history_page_size: usize,

    /// Upper bound for a single collaborator call
    pub request_timeout: Duration,

    /// Prefix of the per-conversation real-time channel key
    pub channel_prefix: String,

    /// Scroll anchoring thresholds
    pub scroll: ScrollConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            participant_id: ParticipantId(1),
            api_token: None,
            feed_page_size: DEFAULT_PAGE_SIZE,
            history_page_size: DEFAULT_PAGE_SIZE,
            request_timeout: Duration::from_secs(15),
            channel_prefix: "chat-".to_string(),
            scroll: ScrollConfig::default(),
        }
    }
}

impl Config {
    /// Real-time channel key for one conversation.
    pub fn channel_key(&self, conversation_id: crate::types::ConversationId) -> String {
        format!("{}{}", self.channel_prefix, conversation_id)
    }

    /// Create config from command line flags (everything after the subcommand).
    ///
    /// Unknown flags are left for the caller and returned as positional arguments.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::default();
        let mut positional = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        InboxError::Config("--api-url requires a URL argument".to_string())
                    })?;
                    config.api_url = url.trim_end_matches('/').to_string();
                    i += 2;
                }
                "--as" => {
                    let id = args.get(i + 1).ok_or_else(|| {
                        InboxError::Config("--as requires a participant id".to_string())
                    })?;
                    config.participant_id = ParticipantId(id.parse::<u64>().map_err(|_| {
                        InboxError::Config("--as must be a valid participant id".to_string())
                    })?);
                    i += 2;
                }
                "--page-size" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        InboxError::Config("--page-size requires a number".to_string())
                    })?;
                    let n = n.parse::<usize>().map_err(|_| {
                        InboxError::Config("--page-size must be a positive number".to_string())
                    })?;
                    config.feed_page_size = n;
                    config.history_page_size = n;
                    i += 2;
                }
                "--timeout-ms" => {
                    let ms = args.get(i + 1).ok_or_else(|| {
                        InboxError::Config("--timeout-ms requires a number".to_string())
                    })?;
                    config.request_timeout = Duration::from_millis(ms.parse::<u64>().map_err(
                        |_| InboxError::Config("--timeout-ms must be a valid number".to_string()),
                    )?);
                    i += 2;
                }
                other => {
                    positional.push(other.to_string());
                    i += 1;
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok((config, positional))
    }

    /// Env overrides (nice for scripts)
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("INBOX_API_URL") {
            self.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(id) = std::env::var("INBOX_PARTICIPANT_ID")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.participant_id = ParticipantId(id);
        }
        if let Ok(token) = std::env::var("INBOX_API_TOKEN") {
            if !token.is_empty() {
                self.api_token = Some(token);
            }
        }
        if let Some(ms) = std::env::var("INBOX_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.request_timeout = Duration::from_millis(ms);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(InboxError::Config(format!(
                "api url must start with http:// or https://, got {}",
                self.api_url
            )));
        }
        if self.feed_page_size == 0 || self.history_page_size == 0 {
            return Err(InboxError::Config("page size must be at least 1".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(InboxError::Config("request timeout must be non-zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.scroll.stick_ratio) || self.scroll.stick_max_gap_px < 0.0 {
            return Err(InboxError::Config("invalid scroll thresholds".to_string()));
        }
        Ok(())
    }
}
