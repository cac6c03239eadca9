//! Per-step attention engine
//!
//! The [`AttentionEngine`] owns the request table (and through it the slot
//! allocator) and the KV store for one model. It is generic over any
//! backend implementing the attention op traits.
//!
//! A step goes through the engine in a fixed order:
//!
//! 1. [`AttentionEngine::begin_step`] validates the batch and resolves slots
//!    for every entry, all or nothing.
//! 2. Per layer, [`AttentionEngine::context_attention`] (prefill) or
//!    [`AttentionEngine::append_kv`] followed by
//!    [`AttentionEngine::decode_attention`] (decode).
//! 3. [`AttentionEngine::on_request_complete`] once a request finishes.
//!
//! Each layer accepts one write per step. A decode kernel only runs on a
//! layer whose new keys/values were appended in the current step, and a
//! repeated descriptor has to go through `begin_step` again before it can
//! write.

use tracing::{debug, info, trace, warn};

use pagedkv::backend::{Backend, ContextAttentionOps, DecodeAttentionOps, KvStoreOps};
use pagedkv::batch::{BatchDescriptor, DecodePlan, Phase, PrefillPlan};
use pagedkv::config::{
    CacheConfig, DecodeStrategy, EngineConfig, HeadLayout, LayerCapabilities,
    ModelAttentionConfig,
};
use pagedkv::slot_allocator::{RequestId, RequestTable};
use pagedkv::tensor::expect_shape;
use pagedkv::{Error, Result};

/// Paged attention engine for one model.
///
/// Holds the only mutable cache state: slot ownership lives in the
/// [`RequestTable`], cached keys/values in `B::KvStore`. Every write goes to
/// a slot owned by the request being written, and every write for a step is
/// issued before the kernel that reads it.
pub struct AttentionEngine<B: Backend> {
    requests: RequestTable,
    store: B::KvStore,
    capabilities: LayerCapabilities,
    cache: CacheConfig,
    decode_strategy: DecodeStrategy,
    current_step: Option<ResolvedStep>,
}

/// The batch accepted by the last `begin_step` and the layers whose new
/// keys/values have been written for it.
struct ResolvedStep {
    batch: BatchDescriptor,
    written: Vec<bool>,
}

impl<B> AttentionEngine<B>
where
    B: KvStoreOps + ContextAttentionOps + DecodeAttentionOps,
{
    /// Create an engine and allocate its KV store.
    ///
    /// The decode strategy is fixed here for the engine's lifetime.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for an empty cache or a zero split-KV
    /// partition, or the backend's error if the store cannot be allocated.
    pub fn new(capabilities: LayerCapabilities, config: EngineConfig) -> Result<Self> {
        if let DecodeStrategy::SplitKv { partition_size: 0 } = config.decode_strategy {
            return Err(Error::InvalidConfig(
                "split-kv partition size must be greater than zero".to_string(),
            ));
        }
        let requests = RequestTable::new(config.cache.max_total_tokens)?;
        let store = B::allocate_kv_store(&config.cache, &capabilities.head_layout)?;
        info!(
            num_layers = config.cache.num_layers,
            max_total_tokens = config.cache.max_total_tokens,
            dtype = %config.cache.dtype,
            num_q_heads = capabilities.head_layout.num_q_heads,
            num_kv_heads = capabilities.head_layout.num_kv_heads,
            head_dim = capabilities.head_layout.head_dim,
            window = ?capabilities.sliding_window.size(),
            strategy = ?config.decode_strategy,
            "attention engine ready"
        );
        Ok(Self {
            requests,
            store,
            capabilities,
            cache: config.cache,
            decode_strategy: config.decode_strategy,
            current_step: None,
        })
    }

    /// Create an engine straight from a model's `config.json` contents.
    ///
    /// # Errors
    /// Returns an error if the config cannot be resolved into capabilities
    /// or the store cannot be allocated.
    pub fn from_model_config(
        model: &ModelAttentionConfig,
        max_total_tokens: usize,
        decode_strategy: DecodeStrategy,
    ) -> Result<Self> {
        let capabilities = model.capabilities()?;
        let cache = model.cache_config(max_total_tokens)?;
        Self::new(
            capabilities,
            EngineConfig {
                cache,
                decode_strategy,
            },
        )
    }

    /// Validate `batch` and resolve slots for every entry.
    ///
    /// New prefill requests are admitted, continuing prefill chunks extend
    /// their request, and decode entries extend theirs by one slot. The
    /// total is checked against the free-list first, so a rejected step
    /// leaves the allocator untouched.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRequest`] for a decode entry with no history,
    /// [`Error::InvalidShape`] if the token count overflows and
    /// [`Error::OutOfCacheCapacity`] if the step does not fit.
    pub fn begin_step(&mut self, batch: &BatchDescriptor) -> Result<()> {
        let mut required: usize = 0;
        for entry in batch.entries() {
            if entry.phase == Phase::Decode && !self.requests.contains(entry.request_id) {
                return Err(Error::UnknownRequest(entry.request_id));
            }
            required = required.checked_add(entry.len).ok_or_else(|| {
                Error::InvalidShape("step token count overflows".to_string())
            })?;
        }

        let available = self.requests.allocator().num_free();
        if required > available {
            warn!(
                requested = required,
                available,
                batch_size = batch.len(),
                "step rejected: cache capacity exhausted"
            );
            return Err(Error::OutOfCacheCapacity {
                requested: required,
                available,
            });
        }

        for entry in batch.entries() {
            if self.requests.contains(entry.request_id) {
                self.requests.extend(entry.request_id, entry.len)?;
            } else {
                self.requests.allocate(entry.request_id, entry.len)?;
            }
        }
        debug!(
            batch_size = batch.len(),
            tokens = required,
            free = self.requests.allocator().num_free(),
            "step resolved"
        );
        self.current_step = Some(ResolvedStep {
            batch: batch.clone(),
            written: vec![false; self.cache.num_layers],
        });
        Ok(())
    }

    fn current(&self, batch: &BatchDescriptor) -> Result<&ResolvedStep> {
        match &self.current_step {
            Some(step) if step.batch == *batch => Ok(step),
            _ => Err(Error::InvalidShape(
                "batch was not resolved by begin_step".to_string(),
            )),
        }
    }

    fn check_unwritten(&self, batch: &BatchDescriptor, layer: usize) -> Result<()> {
        self.check_layer(layer)?;
        if self.current(batch)?.written[layer] {
            return Err(Error::InvalidShape(format!(
                "layer {layer} was already written this step; call begin_step first"
            )));
        }
        Ok(())
    }

    fn mark_written(&mut self, layer: usize) {
        if let Some(step) = self.current_step.as_mut() {
            step.written[layer] = true;
        }
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        if layer < self.cache.num_layers {
            Ok(())
        } else {
            Err(Error::InvalidShape(format!(
                "layer {layer} out of range ({} layers)",
                self.cache.num_layers
            )))
        }
    }

    /// Prefill attention for one layer.
    ///
    /// `q` is `(total_tokens, num_q_heads, head_dim)`; `k` and `v` are
    /// `(total_tokens, num_kv_heads, head_dim)`. The chunk's keys and values
    /// are written to the store first, then each token attends causally over
    /// its request's cached prefix and the chunk, limited by the window.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] for mis-shaped inputs,
    /// [`Error::InvalidShape`] if the layer was already written this step and
    /// [`Error::SlotOwnershipViolation`] if a target slot is not owned by
    /// the request being written.
    pub fn context_attention(
        &mut self,
        layer: usize,
        q: &B::Tensor,
        k: &B::Tensor,
        v: &B::Tensor,
        batch: &BatchDescriptor,
    ) -> Result<B::Tensor> {
        self.check_unwritten(batch, layer)?;
        batch.expect_phase(Phase::Prefill)?;
        let layout = self.capabilities.head_layout;
        let total = batch.total_tokens();
        expect_shape(q, &[total, layout.num_q_heads, layout.head_dim])?;
        expect_shape(k, &[total, layout.num_kv_heads, layout.head_dim])?;
        expect_shape(v, &[total, layout.num_kv_heads, layout.head_dim])?;

        let plan = PrefillPlan::build(batch, &self.requests, self.capabilities.sliding_window)?;
        for view in &plan.views {
            let new_slots = view.new_slots();
            self.requests.verify_owned(view.request_id, new_slots)?;
            B::write_rows(&mut self.store, layer, new_slots, k, v, view.q_row)?;
        }
        // Borrow only `current_step` here: `plan` still borrows `self.requests`.
        if let Some(step) = self.current_step.as_mut() {
            step.written[layer] = true;
        }
        trace!(
            layer,
            requests = plan.views.len(),
            tokens = total,
            max_len_in_batch = plan.max_len_in_batch,
            "context attention"
        );
        B::context_attention(&self.store, layer, q, &plan, &layout)
    }

    /// Write each decode entry's new key/value into its freshly resolved slot.
    ///
    /// `k` and `v` are `(batch_size, num_kv_heads, head_dim)`.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] for mis-shaped inputs,
    /// [`Error::InvalidShape`] if the layer was already appended this step and
    /// [`Error::SlotOwnershipViolation`] on corrupted ownership.
    pub fn append_kv(
        &mut self,
        layer: usize,
        batch: &BatchDescriptor,
        k: &B::Tensor,
        v: &B::Tensor,
    ) -> Result<()> {
        self.check_unwritten(batch, layer)?;
        batch.expect_phase(Phase::Decode)?;
        let layout = self.capabilities.head_layout;
        let expected = [batch.len(), layout.num_kv_heads, layout.head_dim];
        expect_shape(k, &expected)?;
        expect_shape(v, &expected)?;

        for entry in batch.entries() {
            let table = self.requests.table(entry.request_id)?;
            let Some(&slot) = table.slots().last() else {
                return Err(Error::EmptyAttentionWindow {
                    request_id: entry.request_id,
                });
            };
            self.requests.verify_owned(entry.request_id, &[slot])?;
            B::write_rows(&mut self.store, layer, &[slot], k, v, entry.start)?;
        }
        self.mark_written(layer);
        Ok(())
    }

    /// Decode attention for one layer.
    ///
    /// `q` is `(batch_size, num_q_heads, head_dim)`; the output has the same
    /// shape. Each request attends over the visible suffix of its history
    /// (including the token appended by [`AttentionEngine::append_kv`]).
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] if `append_kv` has not run for this
    /// layer in the current step, [`Error::EmptyAttentionWindow`] if a
    /// request has no visible tokens and [`Error::ShapeMismatch`] for a
    /// mis-shaped query.
    pub fn decode_attention(
        &self,
        layer: usize,
        q: &B::Tensor,
        batch: &BatchDescriptor,
    ) -> Result<B::Tensor> {
        self.check_layer(layer)?;
        if !self.current(batch)?.written[layer] {
            return Err(Error::InvalidShape(format!(
                "decode keys/values for layer {layer} were not appended this step"
            )));
        }
        batch.expect_phase(Phase::Decode)?;
        let layout = self.capabilities.head_layout;
        expect_shape(q, &[batch.len(), layout.num_q_heads, layout.head_dim])?;

        let plan = DecodePlan::build(batch, &self.requests, self.capabilities.sliding_window)?;
        trace!(
            layer,
            requests = plan.views.len(),
            total_cache_num = plan.total_cache_num,
            max_len_in_batch = plan.max_len_in_batch,
            strategy = ?self.decode_strategy,
            "decode attention"
        );
        match self.decode_strategy {
            DecodeStrategy::TwoStage => {
                let scores = B::decode_scores(&self.store, layer, q, &plan, &layout)?;
                B::softmax_reduce(&self.store, layer, &scores, &plan, &layout)
            }
            DecodeStrategy::SplitKv { partition_size } => {
                B::decode_split_kv(&self.store, layer, q, &plan, &layout, partition_size)
            }
        }
    }

    /// Write a key/value pair directly into a slot owned by `request_id`.
    ///
    /// # Errors
    /// Returns [`Error::SlotOwnershipViolation`] if the slot belongs to
    /// another request or is free.
    pub fn write_slot(
        &mut self,
        layer: usize,
        request_id: RequestId,
        slot: usize,
        key: &[f32],
        value: &[f32],
    ) -> Result<()> {
        self.requests.allocator().check_owner(slot, request_id)?;
        B::write_slot(&mut self.store, layer, slot, key, value)
    }

    /// Read the key/value pair at a slot owned by `request_id`.
    ///
    /// # Errors
    /// Returns [`Error::SlotOwnershipViolation`] if the slot belongs to
    /// another request or is free.
    pub fn read_slot(
        &self,
        layer: usize,
        request_id: RequestId,
        slot: usize,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        self.requests.allocator().check_owner(slot, request_id)?;
        B::read_slot(&self.store, layer, slot)
    }

    /// Gather a request's full key/value history in token order.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRequest`] if the request is not present.
    pub fn gather_kv(&self, layer: usize, request_id: RequestId) -> Result<(B::Tensor, B::Tensor)> {
        self.check_layer(layer)?;
        let slots = self.requests.table(request_id)?.slots();
        B::gather(&self.store, layer, slots)
    }

    /// Return every slot of a finished or cancelled request to the free-list.
    ///
    /// A step that includes the request is abandoned.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRequest`] if the request is not present.
    pub fn on_request_complete(&mut self, request_id: RequestId) -> Result<usize> {
        let freed = self.requests.free(request_id)?;
        if self.current_step.as_ref().is_some_and(|step| {
            step.batch
                .entries()
                .iter()
                .any(|e| e.request_id == request_id)
        }) {
            self.current_step = None;
        }
        info!(
            request_id,
            freed,
            free = self.requests.allocator().num_free(),
            "request complete"
        );
        Ok(freed)
    }

    /// Total cached length of a request.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRequest`] if the request is not present.
    pub fn seq_len(&self, request_id: RequestId) -> Result<usize> {
        self.requests.seq_len(request_id)
    }

    #[must_use]
    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    #[must_use]
    pub fn num_free_slots(&self) -> usize {
        self.requests.allocator().num_free()
    }

    #[must_use]
    pub fn capabilities(&self) -> &LayerCapabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn head_layout(&self) -> &HeadLayout {
        &self.capabilities.head_layout
    }

    #[must_use]
    pub fn decode_strategy(&self) -> DecodeStrategy {
        self.decode_strategy
    }

    #[must_use]
    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagedkv::config::{ActivationKind, NormKind};
    use pagedkv::window::SlidingWindow;
    use pagedkv::DType;
    use pagedkv_cpu::{CpuBackend, CpuTensor};

    fn capabilities(window: SlidingWindow) -> LayerCapabilities {
        LayerCapabilities {
            norm_kind: NormKind::RmsNorm,
            activation_kind: ActivationKind::Silu,
            sliding_window: window,
            head_layout: HeadLayout::new(2, 1, 4).unwrap(),
        }
    }

    fn engine(max_total_tokens: usize) -> AttentionEngine<CpuBackend> {
        AttentionEngine::new(
            capabilities(SlidingWindow::Unbounded),
            EngineConfig {
                cache: CacheConfig {
                    num_layers: 2,
                    max_total_tokens,
                    dtype: DType::F32,
                },
                decode_strategy: DecodeStrategy::TwoStage,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_zero_partition() {
        let result = AttentionEngine::<CpuBackend>::new(
            capabilities(SlidingWindow::Unbounded),
            EngineConfig {
                cache: CacheConfig::default(),
                decode_strategy: DecodeStrategy::SplitKv { partition_size: 0 },
            },
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_dtype_mismatch() {
        let result = AttentionEngine::<CpuBackend>::new(
            capabilities(SlidingWindow::Unbounded),
            EngineConfig {
                cache: CacheConfig {
                    dtype: DType::BF16,
                    ..CacheConfig::default()
                },
                decode_strategy: DecodeStrategy::TwoStage,
            },
        );
        assert!(matches!(result, Err(Error::UnsupportedDtype(_))));
    }

    #[test]
    fn test_begin_step_is_atomic() {
        let mut engine = engine(6);
        let first = BatchDescriptor::prefill(&[(1, 4)]).unwrap();
        engine.begin_step(&first).unwrap();

        // 1 (decode) + 3 (new prompt) > 2 free
        let batch = BatchDescriptor::new(vec![
            pagedkv::BatchEntry {
                request_id: 1,
                start: 0,
                len: 1,
                phase: Phase::Decode,
            },
            pagedkv::BatchEntry {
                request_id: 2,
                start: 1,
                len: 3,
                phase: Phase::Prefill,
            },
        ])
        .unwrap();
        let err = engine.begin_step(&batch).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(engine.num_free_slots(), 2);
        assert_eq!(engine.seq_len(1).unwrap(), 4);
        assert!(!engine.requests().contains(2));
    }

    #[test]
    fn test_decode_requires_history() {
        let mut engine = engine(8);
        let batch = BatchDescriptor::decode(&[5]).unwrap();
        assert!(matches!(
            engine.begin_step(&batch),
            Err(Error::UnknownRequest(5))
        ));
    }

    #[test]
    fn test_attention_requires_resolved_step() {
        let mut engine = engine(8);
        let batch = BatchDescriptor::prefill(&[(1, 2)]).unwrap();
        let q = CpuTensor::zeros_f32(&[2, 2, 4]);
        let kv = CpuTensor::zeros_f32(&[2, 1, 4]);
        assert!(engine.context_attention(0, &q, &kv, &kv, &batch).is_err());

        engine.begin_step(&batch).unwrap();
        assert!(engine.context_attention(0, &q, &kv, &kv, &batch).is_ok());
        assert!(matches!(
            engine.context_attention(2, &q, &kv, &kv, &batch),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn test_each_layer_is_written_once_per_step() {
        let mut engine = engine(8);
        let prefill = BatchDescriptor::prefill(&[(1, 2)]).unwrap();
        engine.begin_step(&prefill).unwrap();
        let q = CpuTensor::zeros_f32(&[2, 2, 4]);
        let kv = CpuTensor::zeros_f32(&[2, 1, 4]);
        for layer in 0..2 {
            engine.context_attention(layer, &q, &kv, &kv, &prefill).unwrap();
        }
        assert!(matches!(
            engine.context_attention(0, &q, &kv, &kv, &prefill),
            Err(Error::InvalidShape(_))
        ));

        let decode = BatchDescriptor::decode(&[1]).unwrap();
        engine.begin_step(&decode).unwrap();
        let q = CpuTensor::zeros_f32(&[1, 2, 4]);
        let kv = CpuTensor::from_f32(&[1, 1, 4], &[1.0; 4]);
        engine.append_kv(0, &decode, &kv, &kv).unwrap();
        assert!(engine.decode_attention(0, &q, &decode).is_ok());
        assert!(matches!(
            engine.decode_attention(1, &q, &decode),
            Err(Error::InvalidShape(_))
        ));
        assert!(matches!(
            engine.append_kv(0, &decode, &kv, &kv),
            Err(Error::InvalidShape(_))
        ));
        engine.append_kv(1, &decode, &kv, &kv).unwrap();
        assert!(engine.decode_attention(1, &q, &decode).is_ok());
        assert_eq!(engine.seq_len(1).unwrap(), 3);
    }

    #[test]
    fn test_completion_abandons_current_step() {
        let mut engine = engine(8);
        let batch = BatchDescriptor::prefill(&[(1, 2)]).unwrap();
        engine.begin_step(&batch).unwrap();
        engine.on_request_complete(1).unwrap();

        // Request 1 re-admitted under the same id needs a fresh step
        engine.requests.allocate(1, 2).unwrap();
        let q = CpuTensor::zeros_f32(&[2, 2, 4]);
        let kv = CpuTensor::zeros_f32(&[2, 1, 4]);
        assert!(matches!(
            engine.context_attention(0, &q, &kv, &kv, &batch),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn test_slot_access_checks_owner() {
        let mut engine = engine(8);
        let batch = BatchDescriptor::prefill(&[(1, 2), (2, 2)]).unwrap();
        engine.begin_step(&batch).unwrap();
        let slot_of_2 = engine.requests().table(2).unwrap().slots()[0];

        assert!(matches!(
            engine.write_slot(0, 1, slot_of_2, &[0.0; 4], &[0.0; 4]),
            Err(Error::SlotOwnershipViolation { .. })
        ));
        engine
            .write_slot(0, 2, slot_of_2, &[1.0, 2.0, 3.0, 4.0], &[4.0; 4])
            .unwrap();
        let (k, v) = engine.read_slot(0, 2, slot_of_2).unwrap();
        assert_eq!(k, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(v, vec![4.0; 4]);

        engine.on_request_complete(2).unwrap();
        assert!(engine.read_slot(0, 2, slot_of_2).is_err());
    }
}
