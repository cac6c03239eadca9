//! Backend trait and op trait definitions.
//!
//! The engine is generic over `B: Backend` and uses the op traits below to
//! express what it needs from the hardware. Each backend implements them
//! with its own tensor and cache-store types.
//!
//! # Design notes
//!
//! - **Op traits extend `Backend`** and use `Self::Tensor` / `Self::KvStore`
//!   from the supertrait.
//! - **Kernels never look anything up.** Slot resolution and ownership
//!   checks happen before a kernel is issued; kernels receive a
//!   [`PrefillPlan`] or [`DecodePlan`] with slot lists already in place.
//! - **Decode is split into two traits.** The score stage and the
//!   softmax/value-reduce stage are separate entry points so the fused path
//!   can be checked against the reference one.

use crate::batch::{DecodePlan, PrefillPlan};
use crate::config::{CacheConfig, HeadLayout};
use crate::tensor::Tensor;
use crate::Result;

// ---- Core backend trait ----

/// A compute backend.
pub trait Backend: 'static {
    /// Tensor type for queries, keys, values and outputs.
    type Tensor: Tensor + Clone;

    /// Slot-addressed key/value store, one buffer pair per layer.
    type KvStore: Send + Sync;
}

// ---- Op traits ----

/// Cache store allocation and slot-level access.
pub trait KvStoreOps: Backend {
    /// Allocate a zeroed store of `config.max_total_tokens` slots per layer.
    ///
    /// # Errors
    /// Returns an error if `config.dtype` is not what the backend stores.
    fn allocate_kv_store(config: &CacheConfig, layout: &HeadLayout) -> Result<Self::KvStore>;

    /// Overwrite the key and value held at `slot`.
    ///
    /// `key` and `value` are `num_kv_heads * head_dim` elements each.
    ///
    /// # Errors
    /// Returns an error for an out-of-range layer or slot, or a wrong length.
    fn write_slot(
        store: &mut Self::KvStore,
        layer: usize,
        slot: usize,
        key: &[f32],
        value: &[f32],
    ) -> Result<()>;

    /// Read back the key and value at `slot`, widened to `f32`.
    ///
    /// # Errors
    /// Returns an error for an out-of-range layer or slot.
    fn read_slot(store: &Self::KvStore, layer: usize, slot: usize)
        -> Result<(Vec<f32>, Vec<f32>)>;

    /// Scatter rows `first_row..first_row + slots.len()` of `k`/`v`
    /// (`(tokens, num_kv_heads, head_dim)`) into `slots`.
    ///
    /// # Errors
    /// Returns an error for out-of-range rows, slots or layer.
    fn write_rows(
        store: &mut Self::KvStore,
        layer: usize,
        slots: &[usize],
        k: &Self::Tensor,
        v: &Self::Tensor,
        first_row: usize,
    ) -> Result<()>;

    /// Gather the keys and values at `slots` into contiguous
    /// `(slots.len(), num_kv_heads, head_dim)` tensors.
    ///
    /// # Errors
    /// Returns an error for an out-of-range slot or layer.
    fn gather(
        store: &Self::KvStore,
        layer: usize,
        slots: &[usize],
    ) -> Result<(Self::Tensor, Self::Tensor)>;
}

/// Causal attention over prompt chunks whose keys/values are already cached.
pub trait ContextAttentionOps: KvStoreOps {
    /// `q` is `(total_tokens, num_q_heads, head_dim)`; the output has the
    /// same shape. Each query row attends over its request's cached tokens
    /// up to and including its own position, limited by the plan's window.
    ///
    /// # Errors
    /// Returns an error if `q` does not match the plan and layout.
    fn context_attention(
        store: &Self::KvStore,
        layer: usize,
        q: &Self::Tensor,
        plan: &PrefillPlan<'_>,
        layout: &HeadLayout,
    ) -> Result<Self::Tensor>;
}

/// Single-token attention for decode batches.
pub trait DecodeAttentionOps: KvStoreOps {
    /// Stage 1: scaled scores of every query head against its request's
    /// visible keys, packed as `(num_q_heads, plan.total_cache_num)`.
    ///
    /// # Errors
    /// Returns an error if `q` does not match the plan and layout.
    fn decode_scores(
        store: &Self::KvStore,
        layer: usize,
        q: &Self::Tensor,
        plan: &DecodePlan<'_>,
        layout: &HeadLayout,
    ) -> Result<Self::Tensor>;

    /// Stage 2: fused softmax over each request's score segment and the
    /// probability-weighted sum of the matching values.
    /// Output is `(batch, num_q_heads, head_dim)`.
    ///
    /// # Errors
    /// Returns an error if `scores` does not match the plan and layout.
    fn softmax_reduce(
        store: &Self::KvStore,
        layer: usize,
        scores: &Self::Tensor,
        plan: &DecodePlan<'_>,
        layout: &HeadLayout,
    ) -> Result<Self::Tensor>;

    /// Partitioned decode: each partition of `partition_size` visible tokens
    /// is reduced independently and the partials are merged by their
    /// log-sum-exp. Numerically equivalent to the two-stage path.
    ///
    /// # Errors
    /// Returns an error if `q` does not match, or `partition_size` is zero.
    fn decode_split_kv(
        store: &Self::KvStore,
        layer: usize,
        q: &Self::Tensor,
        plan: &DecodePlan<'_>,
        layout: &HeadLayout,
        partition_size: usize,
    ) -> Result<Self::Tensor>;
}
