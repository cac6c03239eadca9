//! Decode attention: packed score stage, fused softmax/reduce stage and the
//! split-KV variant.

use rayon::prelude::*;

use pagedkv::backend::DecodeAttentionOps;
use pagedkv::batch::DecodePlan;
use pagedkv::config::HeadLayout;
use pagedkv::dtype::CacheScalar;
use pagedkv::tensor::expect_shape;
use pagedkv::{Error, Result};

use super::kv_store::CpuKvStore;
use super::scaled_dot;
use super::softmax_reduce::{combine_partials, fused_softmax_reduce};
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Check the plan's packing against the store before any kernel runs.
fn check_plan<T: CacheScalar>(
    store: &CpuKvStore<T>,
    layer: usize,
    plan: &DecodePlan<'_>,
    layout: &HeadLayout,
) -> Result<()> {
    store.check_layout(layout)?;
    let mut att_start = 0;
    for (b, view) in plan.views.iter().enumerate() {
        if view.q_row != b
            || view.att_start != att_start
            || view.slots.len() != view.visible.len
            || view.visible.is_empty()
        {
            return Err(Error::InvalidShape(format!(
                "decode view for request {} is inconsistent: row {}, att_start {}, visible {:?}, slots {}",
                view.request_id,
                view.q_row,
                view.att_start,
                view.visible,
                view.slots.len()
            )));
        }
        store.check_slots(layer, view.slots)?;
        att_start += view.visible.len;
    }
    if att_start != plan.total_cache_num {
        return Err(Error::InvalidShape(format!(
            "decode plan packs {att_start} scores but declares {}",
            plan.total_cache_num
        )));
    }
    Ok(())
}

fn output_shape(plan: &DecodePlan<'_>, layout: &HeadLayout) -> [usize; 3] {
    [plan.views.len(), layout.num_q_heads, layout.head_dim]
}

impl<T: CacheScalar> DecodeAttentionOps for CpuBackend<T> {
    fn decode_scores(
        store: &CpuKvStore<T>,
        layer: usize,
        q: &CpuTensor,
        plan: &DecodePlan<'_>,
        layout: &HeadLayout,
    ) -> Result<CpuTensor> {
        check_plan(store, layer, plan, layout)?;
        expect_shape(q, &output_shape(plan, layout))?;

        let num_heads = layout.num_q_heads;
        let head_dim = layout.head_dim;
        let total = plan.total_cache_num;
        let scale = layout.scale();
        let q_data = q.f32_data();
        let mut att = vec![0.0f32; num_heads * total];

        if total > 0 {
            att.par_chunks_mut(total).enumerate().for_each(|(h, row)| {
                let kv_h = layout.kv_head_for(h);
                for (b, view) in plan.views.iter().enumerate() {
                    let q_off = (b * num_heads + h) * head_dim;
                    let q_vec = &q_data[q_off..q_off + head_dim];
                    let seg = &mut row[view.att_start..view.att_start + view.visible.len];
                    for (score, &slot) in seg.iter_mut().zip(view.slots) {
                        *score = scaled_dot(q_vec, store.key(layer, slot, kv_h), scale);
                    }
                }
            });
        }

        Ok(CpuTensor::from_f32(&[num_heads, total], &att))
    }

    fn softmax_reduce(
        store: &CpuKvStore<T>,
        layer: usize,
        scores: &CpuTensor,
        plan: &DecodePlan<'_>,
        layout: &HeadLayout,
    ) -> Result<CpuTensor> {
        check_plan(store, layer, plan, layout)?;
        let total = plan.total_cache_num;
        expect_shape(scores, &[layout.num_q_heads, total])?;

        let num_heads = layout.num_q_heads;
        let head_dim = layout.head_dim;
        let att = scores.f32_data();
        let out_shape = output_shape(plan, layout);
        let mut output = vec![0.0f32; out_shape.iter().product()];

        output
            .par_chunks_mut(head_dim)
            .enumerate()
            .for_each(|(idx, out)| {
                let view = &plan.views[idx / num_heads];
                let h = idx % num_heads;
                let kv_h = layout.kv_head_for(h);
                let seg = &att[h * total + view.att_start..][..view.visible.len];
                fused_softmax_reduce(seg, |j| store.value(layer, view.slots[j], kv_h), out);
            });

        Ok(CpuTensor::from_f32(&out_shape, &output))
    }

    fn decode_split_kv(
        store: &CpuKvStore<T>,
        layer: usize,
        q: &CpuTensor,
        plan: &DecodePlan<'_>,
        layout: &HeadLayout,
        partition_size: usize,
    ) -> Result<CpuTensor> {
        if partition_size == 0 {
            return Err(Error::InvalidConfig(
                "split-kv partition size must be greater than zero".to_string(),
            ));
        }
        check_plan(store, layer, plan, layout)?;
        let out_shape = output_shape(plan, layout);
        expect_shape(q, &out_shape)?;

        let num_heads = layout.num_q_heads;
        let head_dim = layout.head_dim;
        let scale = layout.scale();
        let q_data = q.f32_data();
        let mut output = vec![0.0f32; out_shape.iter().product()];

        output
            .par_chunks_mut(head_dim)
            .enumerate()
            .for_each(|(idx, out)| {
                let view = &plan.views[idx / num_heads];
                let kv_h = layout.kv_head_for(idx % num_heads);
                let q_vec = &q_data[idx * head_dim..(idx + 1) * head_dim];

                let num_parts = view.slots.len().div_ceil(partition_size);
                let mut partials = vec![0.0f32; num_parts * head_dim];
                let mut lses = Vec::with_capacity(num_parts);
                for (chunk, part_out) in view
                    .slots
                    .chunks(partition_size)
                    .zip(partials.chunks_mut(head_dim))
                {
                    let scores: Vec<f32> = chunk
                        .iter()
                        .map(|&slot| scaled_dot(q_vec, store.key(layer, slot, kv_h), scale))
                        .collect();
                    lses.push(fused_softmax_reduce(
                        &scores,
                        |j| store.value(layer, chunk[j], kv_h),
                        part_out,
                    ));
                }
                combine_partials(&partials, &lses, out);
            });

        Ok(CpuTensor::from_f32(&out_shape, &output))
    }
}
