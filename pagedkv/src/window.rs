//! Sliding-window bounds.
//!
//! A request of total length `L` under a window of `W` tokens sees the suffix
//! `[L - min(L, W), L)` of its token table. Nothing here is stored: the range
//! is derived from `L` every step because `L` grows by one per decode step.

use crate::{Error, Result};

/// Maximum number of most-recent tokens visible to attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlidingWindow {
    /// Every cached token is visible.
    #[default]
    Unbounded,
    /// Only the last `n` tokens are visible (`n > 0`).
    Bounded(usize),
}

impl SlidingWindow {
    /// Build a window from an optional size as found in model configs.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for `Some(0)`, which would leave every
    /// query with nothing to attend to.
    pub fn new(size: Option<usize>) -> Result<Self> {
        match size {
            None => Ok(Self::Unbounded),
            Some(0) => Err(Error::InvalidConfig(
                "sliding window must be greater than zero".to_string(),
            )),
            Some(n) => Ok(Self::Bounded(n)),
        }
    }

    /// The configured size, or `None` when unbounded.
    #[must_use]
    pub fn size(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(n) => Some(n),
        }
    }

    #[must_use]
    pub fn is_bounded(self) -> bool {
        matches!(self, Self::Bounded(_))
    }

    /// Visible range for a request whose cache holds `total_len` tokens.
    #[must_use]
    pub fn visible_range(self, total_len: usize) -> VisibleRange {
        let len = match self {
            Self::Unbounded => total_len,
            Self::Bounded(w) => total_len.min(w),
        };
        VisibleRange {
            start: total_len - len,
            len,
        }
    }

    /// Visible range for the query at token position `query_pos` (0-based).
    ///
    /// The query always sees itself; causal masking hides everything after it.
    #[must_use]
    pub fn causal_range(self, query_pos: usize) -> VisibleRange {
        self.visible_range(query_pos + 1)
    }
}

/// A contiguous suffix of a request's token table, in token positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleRange {
    /// First visible token position.
    pub start: usize,
    /// Number of visible tokens.
    pub len: usize,
}

impl VisibleRange {
    /// One past the last visible position.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn contains(&self, pos: usize) -> bool {
        pos >= self.start && pos < self.end()
    }
}
