/// Scroll anchoring for the message viewport.
///
/// Keeps the reading position fixed when older messages are prepended and decides
/// whether an append should follow the tail or bump the "new messages" counter.
use crate::config::ScrollConfig;

/// Small delta used to ignore layout rounding.
pub const SCROLL_EPSILON: f64 = 1.0;

/// Geometry reported by the renderer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn new(scroll_top: f64, scroll_height: f64, client_height: f64) -> Self {
        Self {
            scroll_top,
            scroll_height,
            client_height,
        }
    }

    /// Maximum possible `scroll_top`.
    pub fn scrollable_height(&self) -> f64 {
        (self.scroll_height - self.client_height).max(0.0)
    }

    /// Distance between the viewport bottom and the content bottom.
    pub fn gap(&self) -> f64 {
        (self.scrollable_height() - self.scroll_top).max(0.0)
    }

    /// `gap / scrollable_height`; zero when the content fits in the viewport.
    pub fn distance_ratio(&self) -> f64 {
        let scrollable = self.scrollable_height();
        if scrollable <= 0.0 {
            0.0
        } else {
            self.gap() / scrollable
        }
    }
}

/// Instruction for the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollCommand {
    SetScrollTop(f64),
    ScrollToBottom { smooth: bool },
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppendDecision {
    /// The user was at the bottom; follow the new content.
    StickToBottom(ScrollCommand),
    /// The user is reading history; show "N new messages".
    Indicate { unseen: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PrependAnchor {
    scroll_height: f64,
    scroll_top: f64,
}

#[derive(Debug, Clone)]
pub struct ScrollAnchorController {
    config: ScrollConfig,
    metrics: ScrollMetrics,
    anchor: Option<PrependAnchor>,
    unseen: usize,
}

impl ScrollAnchorController {
    pub fn new(config: ScrollConfig) -> Self {
        Self {
            config,
            metrics: ScrollMetrics::default(),
            anchor: None,
            unseen: 0,
        }
    }

    pub fn metrics(&self) -> ScrollMetrics {
        self.metrics
    }

    pub fn unseen_count(&self) -> usize {
        self.unseen
    }

    pub fn has_pending_anchor(&self) -> bool {
        self.anchor.is_some()
    }

    /// True when the viewport counts as "at the bottom".
    pub fn is_at_bottom(&self) -> bool {
        self.metrics.distance_ratio() < self.config.stick_ratio
            && self.metrics.gap() <= self.config.stick_max_gap_px
    }

    /// Records fresh geometry after a user scroll or a layout pass.
    ///
    /// Reaching the bottom counts as having seen everything.
    pub fn on_viewport(&mut self, metrics: ScrollMetrics) {
        self.metrics = metrics;
        if self.unseen > 0 && self.metrics.gap() <= SCROLL_EPSILON {
            self.unseen = 0;
        }
    }

    /// Captures the geometry right before older content is inserted on top.
    pub fn on_before_prepend(&mut self) {
        self.anchor = Some(PrependAnchor {
            scroll_height: self.metrics.scroll_height,
            scroll_top: self.metrics.scroll_top,
        });
    }

    /// Restores the reading position once the prepended content has been laid out.
    ///
    /// Returns `None` when no prepend was pending.
    pub fn on_after_prepend(&mut self, new_scroll_height: f64) -> Option<ScrollCommand> {
        let anchor = self.anchor.take()?;
        let delta = (new_scroll_height - anchor.scroll_height).max(0.0);
        let scroll_top = anchor.scroll_top + delta;
        self.metrics.scroll_height = new_scroll_height;
        self.metrics.scroll_top = scroll_top;
        Some(ScrollCommand::SetScrollTop(scroll_top))
    }

    /// Decides how to react to `new_count` messages added at the tail.
    pub fn on_append(&mut self, new_count: usize) -> AppendDecision {
        if self.is_at_bottom() {
            self.unseen = 0;
            AppendDecision::StickToBottom(ScrollCommand::ScrollToBottom { smooth: true })
        } else {
            self.unseen += new_count;
            AppendDecision::Indicate {
                unseen: self.unseen,
            }
        }
    }

    /// Explicit "jump to latest" request.
    pub fn jump_to_bottom(&mut self) -> ScrollCommand {
        self.unseen = 0;
        self.metrics.scroll_top = self.metrics.scrollable_height();
        ScrollCommand::ScrollToBottom { smooth: true }
    }

    /// Forget everything, e.g. when a different conversation is shown.
    pub fn reset(&mut self) {
        self.metrics = ScrollMetrics::default();
        self.anchor = None;
        self.unseen = 0;
    }
}

impl Default for ScrollAnchorController {
    fn default() -> Self {
        Self::new(ScrollConfig::default())
    }
}
