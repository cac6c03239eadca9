//! Batch descriptors and the per-step attention plans derived from them.
//!
//! The external scheduler hands over a [`BatchDescriptor`]: an ordered list
//! of `(request, start offset, length, phase)` entries packed back-to-back in
//! the flattened query tensor. Once slots are resolved, the descriptor is
//! combined with the [`RequestTable`] into a [`PrefillPlan`] or a
//! [`DecodePlan`], which carry everything a kernel needs (raw lengths,
//! visible ranges, packed score offsets, slot lists) so that no lookups
//! happen inside the kernel.

use std::collections::HashSet;

use crate::slot_allocator::{RequestId, RequestTable};
use crate::window::{SlidingWindow, VisibleRange};
use crate::{Error, Result};

/// Whether an entry processes prompt tokens or one generated token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prefill,
    Decode,
}

/// One request's share of the flattened batch tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub request_id: RequestId,
    /// First row of this request in the flattened query/output tensor.
    pub start: usize,
    /// Rows contributed this step: chunk length for prefill, 1 for decode.
    pub len: usize,
    pub phase: Phase,
}

/// Validated, ordered batch handed over by the scheduler.
///
/// Invariants: entries are packed (`start` of each entry equals the sum of
/// previous lengths), no request appears twice, every length is non-zero and
/// decode entries have length 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    entries: Vec<BatchEntry>,
}

impl BatchDescriptor {
    /// Validate scheduler-provided entries.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] if any invariant is violated.
    pub fn new(entries: Vec<BatchEntry>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(entries.len());
        let mut expected_start = 0;
        for entry in &entries {
            if !seen.insert(entry.request_id) {
                return Err(Error::InvalidShape(format!(
                    "request {} appears twice in batch",
                    entry.request_id
                )));
            }
            if entry.len == 0 {
                return Err(Error::InvalidShape(format!(
                    "request {} contributes zero tokens",
                    entry.request_id
                )));
            }
            if entry.phase == Phase::Decode && entry.len != 1 {
                return Err(Error::InvalidShape(format!(
                    "decode entry for request {} has {} tokens, expected 1",
                    entry.request_id, entry.len
                )));
            }
            if entry.start != expected_start {
                return Err(Error::InvalidShape(format!(
                    "request {} starts at row {}, expected {expected_start}",
                    entry.request_id, entry.start
                )));
            }
            expected_start = expected_start.checked_add(entry.len).ok_or_else(|| {
                Error::InvalidShape(format!(
                    "request {} overflows the batch row count",
                    entry.request_id
                ))
            })?;
        }
        Ok(Self { entries })
    }

    /// Pack `(request, chunk_len)` pairs into a prefill batch.
    ///
    /// # Errors
    /// Same as [`BatchDescriptor::new`].
    pub fn prefill(requests: &[(RequestId, usize)]) -> Result<Self> {
        Self::packed(requests.iter().map(|&(id, len)| (id, len, Phase::Prefill)))
    }

    /// Pack one decode token per request.
    ///
    /// # Errors
    /// Same as [`BatchDescriptor::new`].
    pub fn decode(requests: &[RequestId]) -> Result<Self> {
        Self::packed(requests.iter().map(|&id| (id, 1, Phase::Decode)))
    }

    fn packed(items: impl Iterator<Item = (RequestId, usize, Phase)>) -> Result<Self> {
        let mut start = 0;
        let entries = items
            .map(|(request_id, len, phase)| {
                let entry = BatchEntry {
                    request_id,
                    start,
                    len,
                    phase,
                };
                start = start.saturating_add(len);
                entry
            })
            .collect();
        Self::new(entries)
    }

    #[must_use]
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows in the flattened batch tensor (`sum(lengths)`).
    #[must_use]
    pub fn total_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.len).sum()
    }

    /// Longest chunk in the batch.
    #[must_use]
    pub fn max_len_in_batch(&self) -> usize {
        self.entries.iter().map(|e| e.len).max().unwrap_or(0)
    }

    /// Ensure every entry has the given phase.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] naming the first offending request.
    pub fn expect_phase(&self, phase: Phase) -> Result<()> {
        match self.entries.iter().find(|e| e.phase != phase) {
            None => Ok(()),
            Some(e) => Err(Error::InvalidShape(format!(
                "request {} is in {:?} phase, expected {phase:?}",
                e.request_id, e.phase
            ))),
        }
    }
}

/// Prefill view of one request after its chunk's slots were resolved.
#[derive(Debug, Clone)]
pub struct PrefillView<'a> {
    pub request_id: RequestId,
    /// First row in the flattened query/key/value/output tensors.
    pub q_row: usize,
    /// Tokens in this chunk.
    pub new_len: usize,
    /// Tokens cached before this chunk (non-zero for chunked prefill).
    pub cached_len: usize,
    /// Full token table including the chunk, in token order.
    pub slots: &'a [usize],
}

impl PrefillView<'_> {
    /// Slots the chunk's keys/values are written to.
    #[must_use]
    pub fn new_slots(&self) -> &[usize] {
        &self.slots[self.cached_len..]
    }

    /// Token position of chunk row `i`.
    #[must_use]
    pub fn position(&self, i: usize) -> usize {
        self.cached_len + i
    }
}

/// Everything the context kernel reads for one step.
#[derive(Debug, Clone)]
pub struct PrefillPlan<'a> {
    pub views: Vec<PrefillView<'a>>,
    pub window: SlidingWindow,
    pub total_tokens: usize,
    pub max_len_in_batch: usize,
}

impl<'a> PrefillPlan<'a> {
    /// Build the plan for a prefill batch whose slots are already allocated.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRequest`] for requests without a token table,
    /// or [`Error::InvalidShape`] if a table is shorter than its chunk.
    pub fn build(
        batch: &BatchDescriptor,
        table: &'a RequestTable,
        window: SlidingWindow,
    ) -> Result<Self> {
        batch.expect_phase(Phase::Prefill)?;
        let views = batch
            .entries()
            .iter()
            .map(|entry| {
                let slots = table.table(entry.request_id)?.slots();
                let cached_len = slots.len().checked_sub(entry.len).ok_or_else(|| {
                    Error::InvalidShape(format!(
                        "request {} holds {} slots but its chunk has {} tokens",
                        entry.request_id,
                        slots.len(),
                        entry.len
                    ))
                })?;
                Ok(PrefillView {
                    request_id: entry.request_id,
                    q_row: entry.start,
                    new_len: entry.len,
                    cached_len,
                    slots,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            views,
            window,
            total_tokens: batch.total_tokens(),
            max_len_in_batch: batch.max_len_in_batch(),
        })
    }
}

/// Decode view of one request: raw and attention-visible bookkeeping.
#[derive(Debug, Clone)]
pub struct DecodeView<'a> {
    pub request_id: RequestId,
    /// Row of this request's query/output vector.
    pub q_row: usize,
    /// Total cached length including the token being decoded.
    pub seq_len: usize,
    /// Visible suffix of the token table.
    pub visible: VisibleRange,
    /// Column of this request's first score in the packed score matrix.
    pub att_start: usize,
    /// Slots of the visible range, in token order.
    pub slots: &'a [usize],
}

/// Everything the decode kernels read for one step.
#[derive(Debug, Clone)]
pub struct DecodePlan<'a> {
    pub views: Vec<DecodeView<'a>>,
    /// Width of the packed score matrix (sum of visible lengths).
    pub total_cache_num: usize,
    /// Longest visible range in the batch.
    pub max_len_in_batch: usize,
}

impl<'a> DecodePlan<'a> {
    /// Build the plan for a decode batch whose new tokens are already cached.
    ///
    /// # Errors
    /// Returns [`Error::EmptyAttentionWindow`] if a request has nothing
    /// visible, and [`Error::UnknownRequest`] for requests without a table.
    pub fn build(
        batch: &BatchDescriptor,
        table: &'a RequestTable,
        window: SlidingWindow,
    ) -> Result<Self> {
        batch.expect_phase(Phase::Decode)?;
        let mut att_start = 0;
        let mut max_len_in_batch = 0;
        let mut views = Vec::with_capacity(batch.len());
        for entry in batch.entries() {
            let tokens = table.table(entry.request_id)?;
            let seq_len = tokens.seq_len();
            let visible = window.visible_range(seq_len);
            if visible.is_empty() {
                return Err(Error::EmptyAttentionWindow {
                    request_id: entry.request_id,
                });
            }
            views.push(DecodeView {
                request_id: entry.request_id,
                q_row: entry.start,
                seq_len,
                visible,
                att_start,
                slots: tokens.range(visible),
            });
            att_start += visible.len;
            max_len_in_batch = max_len_in_batch.max(visible.len);
        }
        Ok(Self {
            views,
            total_cache_num: att_start,
            max_len_in_batch,
        })
    }

    /// Raw `(start offset, length)` arrays as the scheduler sees them.
    #[must_use]
    pub fn seq_arrays(&self) -> (Vec<usize>, Vec<usize>) {
        self.views.iter().map(|v| (v.q_row, v.seq_len)).unzip()
    }

    /// Attention-visible `(packed start, length)` arrays.
    #[must_use]
    pub fn att_arrays(&self) -> (Vec<usize>, Vec<usize>) {
        self.views
            .iter()
            .map(|v| (v.att_start, v.visible.len))
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_constructors() {
        let batch = BatchDescriptor::prefill(&[(1, 3), (2, 5)]).unwrap();
        assert_eq!(batch.total_tokens(), 8);
        assert_eq!(batch.entries()[1].start, 3);
        assert_eq!(batch.max_len_in_batch(), 5);

        let batch = BatchDescriptor::decode(&[4, 5, 6]).unwrap();
        assert_eq!(batch.total_tokens(), 3);
        assert_eq!(batch.entries()[2].start, 2);
        assert!(batch.expect_phase(Phase::Decode).is_ok());
        assert!(batch.expect_phase(Phase::Prefill).is_err());
    }

    #[test]
    fn rejects_gaps_and_duplicates() {
        let gap = vec![
            BatchEntry {
                request_id: 1,
                start: 0,
                len: 2,
                phase: Phase::Prefill,
            },
            BatchEntry {
                request_id: 2,
                start: 3,
                len: 1,
                phase: Phase::Prefill,
            },
        ];
        assert!(matches!(
            BatchDescriptor::new(gap),
            Err(Error::InvalidShape(_))
        ));
        assert!(BatchDescriptor::prefill(&[(1, 2), (1, 2)]).is_err());
        assert!(BatchDescriptor::prefill(&[(1, 0)]).is_err());
    }

    #[test]
    fn decode_entries_must_have_one_token() {
        let entries = vec![BatchEntry {
            request_id: 1,
            start: 0,
            len: 2,
            phase: Phase::Decode,
        }];
        assert!(BatchDescriptor::new(entries).is_err());
    }

    #[test]
    fn row_count_overflow_is_rejected() {
        assert!(matches!(
            BatchDescriptor::prefill(&[(1, usize::MAX), (2, 1)]),
            Err(Error::InvalidShape(_))
        ));
        let entries = vec![
            BatchEntry {
                request_id: 1,
                start: 0,
                len: usize::MAX,
                phase: Phase::Prefill,
            },
            BatchEntry {
                request_id: 2,
                start: usize::MAX,
                len: 2,
                phase: Phase::Prefill,
            },
        ];
        assert!(matches!(
            BatchDescriptor::new(entries),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn decode_plan_with_window() {
        // Two requests of length 3 and 5 under window 4
        let mut table = RequestTable::new(16).unwrap();
        table.allocate(1, 3).unwrap();
        table.allocate(2, 5).unwrap();
        let batch = BatchDescriptor::decode(&[1, 2]).unwrap();

        let plan = DecodePlan::build(&batch, &table, SlidingWindow::Bounded(4)).unwrap();
        assert_eq!(plan.seq_arrays(), (vec![0, 1], vec![3, 5]));
        assert_eq!(plan.att_arrays(), (vec![0, 3], vec![3, 4]));
        assert_eq!(plan.views[1].visible, VisibleRange { start: 1, len: 4 });
        assert_eq!(plan.views[1].slots, &[4, 5, 6, 7]);
        assert_eq!(plan.total_cache_num, 7);
        assert_eq!(plan.max_len_in_batch, 4);
    }

    #[test]
    fn decode_plan_rejects_empty_history() {
        let mut table = RequestTable::new(4).unwrap();
        table.allocate(1, 0).unwrap();
        let batch = BatchDescriptor::decode(&[1]).unwrap();
        assert!(matches!(
            DecodePlan::build(&batch, &table, SlidingWindow::Unbounded),
            Err(Error::EmptyAttentionWindow { request_id: 1 })
        ));
    }

    #[test]
    fn prefill_plan_tracks_cached_prefix() {
        let mut table = RequestTable::new(16).unwrap();
        table.allocate(1, 4).unwrap();
        table.extend(1, 3).unwrap();
        table.allocate(2, 2).unwrap();
        let batch = BatchDescriptor::prefill(&[(1, 3), (2, 2)]).unwrap();

        let plan = PrefillPlan::build(&batch, &table, SlidingWindow::Unbounded).unwrap();
        assert_eq!(plan.views[0].cached_len, 4);
        assert_eq!(plan.views[0].new_slots().len(), 3);
        assert_eq!(plan.views[0].position(2), 6);
        assert_eq!(plan.views[1].cached_len, 0);
        assert_eq!(plan.views[1].q_row, 3);
        assert_eq!(plan.total_tokens, 5);
    }

    #[test]
    fn plans_require_known_requests() {
        let table = RequestTable::new(4).unwrap();
        let batch = BatchDescriptor::prefill(&[(3, 1)]).unwrap();
        assert!(matches!(
            PrefillPlan::build(&batch, &table, SlidingWindow::Unbounded),
            Err(Error::UnknownRequest(3))
        ));
    }
}
