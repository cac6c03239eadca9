//! Context (prefill) attention over the paged store.

use rayon::prelude::*;

use pagedkv::backend::ContextAttentionOps;
use pagedkv::batch::{PrefillPlan, PrefillView};
use pagedkv::config::HeadLayout;
use pagedkv::dtype::CacheScalar;
use pagedkv::tensor::expect_shape;
use pagedkv::{Error, Result};

use super::kv_store::CpuKvStore;
use super::scaled_dot;
use super::softmax_reduce::fused_softmax_reduce;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Map every flattened query row to its request view and token position.
fn row_positions<'p, 'a, T: CacheScalar>(
    store: &CpuKvStore<T>,
    layer: usize,
    plan: &'p PrefillPlan<'a>,
) -> Result<Vec<(&'p PrefillView<'a>, usize)>> {
    let mut rows = Vec::with_capacity(plan.total_tokens);
    for view in &plan.views {
        if view.q_row != rows.len() || view.cached_len + view.new_len != view.slots.len() {
            return Err(Error::InvalidShape(format!(
                "prefill view for request {} is inconsistent: row {}, cached {}, new {}, slots {}",
                view.request_id,
                view.q_row,
                view.cached_len,
                view.new_len,
                view.slots.len()
            )));
        }
        store.check_slots(layer, view.slots)?;
        rows.extend((0..view.new_len).map(|i| (view, view.position(i))));
    }
    if rows.len() != plan.total_tokens {
        return Err(Error::InvalidShape(format!(
            "prefill plan covers {} rows but declares {}",
            rows.len(),
            plan.total_tokens
        )));
    }
    Ok(rows)
}

impl<T: CacheScalar> ContextAttentionOps for CpuBackend<T> {
    fn context_attention(
        store: &CpuKvStore<T>,
        layer: usize,
        q: &CpuTensor,
        plan: &PrefillPlan<'_>,
        layout: &HeadLayout,
    ) -> Result<CpuTensor> {
        store.check_layout(layout)?;
        let num_heads = layout.num_q_heads;
        let head_dim = layout.head_dim;
        let out_shape = [plan.total_tokens, num_heads, head_dim];
        expect_shape(q, &out_shape)?;
        let rows = row_positions(store, layer, plan)?;

        let q_data = q.f32_data();
        let scale = layout.scale();
        let window = plan.window;
        let mut output = vec![0.0f32; plan.total_tokens * num_heads * head_dim];

        output
            .par_chunks_mut(head_dim)
            .enumerate()
            .for_each(|(idx, out)| {
                let (view, pos) = rows[idx / num_heads];
                let kv_h = layout.kv_head_for(idx % num_heads);
                let q_vec = &q_data[idx * head_dim..(idx + 1) * head_dim];

                // Causal + sliding window: positions [pos + 1 - min(pos + 1, W), pos]
                let range = window.causal_range(pos);
                let slots = &view.slots[range.start..range.end()];
                let scores: Vec<f32> = slots
                    .iter()
                    .map(|&slot| scaled_dot(q_vec, store.key(layer, slot, kv_h), scale))
                    .collect();
                fused_softmax_reduce(&scores, |j| store.value(layer, slots[j], kv_h), out);
            });

        Ok(CpuTensor::from_f32(&out_shape, &output))
    }
}
