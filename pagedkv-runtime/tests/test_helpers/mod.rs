//! Shared helpers for the engine integration tests.
#![allow(dead_code)]

use std::ops::Range;

use pagedkv::config::{
    ActivationKind, CacheConfig, DecodeStrategy, EngineConfig, HeadLayout, LayerCapabilities,
    NormKind,
};
use pagedkv::dtype::CacheScalar;
use pagedkv::window::SlidingWindow;
use pagedkv::{BatchDescriptor, Phase, RequestId, Result};
use pagedkv_cpu::{CpuBackend, CpuTensor};
use pagedkv_runtime::AttentionEngine;

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y} (tol {tol})");
    }
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Deterministic pseudo-random values in [-1, 1].
#[allow(clippy::cast_precision_loss)]
pub fn pattern(n: usize, seed: f32) -> Vec<f32> {
    (0..n)
        .map(|i| ((i as f32 + 1.0) * 0.618 + seed * 1.37).sin())
        .collect()
}

pub fn capabilities(layout: HeadLayout, window: SlidingWindow) -> LayerCapabilities {
    LayerCapabilities {
        norm_kind: NormKind::RmsNorm,
        activation_kind: ActivationKind::Silu,
        sliding_window: window,
        head_layout: layout,
    }
}

pub fn engine_with<T: CacheScalar>(
    layout: HeadLayout,
    window: SlidingWindow,
    max_total_tokens: usize,
    decode_strategy: DecodeStrategy,
) -> AttentionEngine<CpuBackend<T>> {
    AttentionEngine::new(
        capabilities(layout, window),
        EngineConfig {
            cache: CacheConfig {
                num_layers: 1,
                max_total_tokens,
                dtype: T::DTYPE,
            },
            decode_strategy,
        },
    )
    .unwrap()
}

pub fn engine(
    layout: HeadLayout,
    window: SlidingWindow,
    max_total_tokens: usize,
) -> AttentionEngine<CpuBackend> {
    engine_with::<f32>(layout, window, max_total_tokens, DecodeStrategy::TwoStage)
}

/// Full per-token q/k/v data for one request.
#[derive(Clone)]
pub struct Seq {
    pub id: RequestId,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    layout: HeadLayout,
}

impl Seq {
    pub fn new(id: RequestId, len: usize, layout: HeadLayout, seed: f32) -> Self {
        Self {
            id,
            q: pattern(len * layout.q_width(), seed),
            k: pattern(len * layout.kv_width(), seed + 10.0),
            v: pattern(len * layout.kv_width(), seed + 20.0),
            layout,
        }
    }

    pub fn q_rows(&self, rows: Range<usize>) -> &[f32] {
        let w = self.layout.q_width();
        &self.q[rows.start * w..rows.end * w]
    }

    pub fn k_rows(&self, rows: Range<usize>) -> &[f32] {
        let w = self.layout.kv_width();
        &self.k[rows.start * w..rows.end * w]
    }

    pub fn v_rows(&self, rows: Range<usize>) -> &[f32] {
        let w = self.layout.kv_width();
        &self.v[rows.start * w..rows.end * w]
    }

    /// Overwrite the key and value of token `pos` with a constant.
    pub fn set_kv(&mut self, pos: usize, key: f32, value: f32) {
        let w = self.layout.kv_width();
        self.k[pos * w..(pos + 1) * w].fill(key);
        self.v[pos * w..(pos + 1) * w].fill(value);
    }
}

/// Run one step on layer 0 and return the flattened output.
///
/// Each part is `(sequence, token rows processed this step)`. Prefill parts
/// go through `context_attention`; decode parts (one row each) through
/// `append_kv` + `decode_attention`.
pub fn run_step<T: CacheScalar>(
    engine: &mut AttentionEngine<CpuBackend<T>>,
    parts: &[(&Seq, Range<usize>)],
    phase: Phase,
) -> Result<Vec<f32>> {
    let layout = *engine.head_layout();
    let batch = match phase {
        Phase::Prefill => BatchDescriptor::prefill(
            &parts
                .iter()
                .map(|(s, r)| (s.id, r.len()))
                .collect::<Vec<_>>(),
        )?,
        Phase::Decode => {
            BatchDescriptor::decode(&parts.iter().map(|(s, _)| s.id).collect::<Vec<_>>())?
        }
    };
    let total = batch.total_tokens();
    let mut q = Vec::new();
    let mut k = Vec::new();
    let mut v = Vec::new();
    for (seq, rows) in parts {
        q.extend_from_slice(seq.q_rows(rows.clone()));
        k.extend_from_slice(seq.k_rows(rows.clone()));
        v.extend_from_slice(seq.v_rows(rows.clone()));
    }
    let q = CpuTensor::from_f32(&[total, layout.num_q_heads, layout.head_dim], &q);
    let k = CpuTensor::from_f32(&[total, layout.num_kv_heads, layout.head_dim], &k);
    let v = CpuTensor::from_f32(&[total, layout.num_kv_heads, layout.head_dim], &v);

    engine.begin_step(&batch)?;
    let out = match phase {
        Phase::Prefill => engine.context_attention(0, &q, &k, &v, &batch)?,
        Phase::Decode => {
            engine.append_kv(0, &batch, &k, &v)?;
            engine.decode_attention(0, &q, &batch)?
        }
    };
    Ok(out.to_f32_vec())
}

/// Dense attention of token `query_pos`'s query over `positions` of `seq`.
pub fn reference(seq: &Seq, query_pos: usize, positions: Range<usize>) -> Vec<f32> {
    let layout = seq.layout;
    let (nh, nkv, hd) = (layout.num_q_heads, layout.num_kv_heads, layout.head_dim);
    let q = seq.q_rows(query_pos..query_pos + 1);
    let mut out = vec![0.0f32; nh * hd];
    for h in 0..nh {
        let kv_h = layout.kv_head_for(h);
        let qv = &q[h * hd..(h + 1) * hd];
        let scores: Vec<f32> = positions
            .clone()
            .map(|t| {
                let kv = &seq.k[(t * nkv + kv_h) * hd..][..hd];
                qv.iter().zip(kv).map(|(a, b)| a * b).sum::<f32>() * layout.scale()
            })
            .collect();
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        for (e, t) in exps.iter().zip(positions.clone()) {
            let vv = &seq.v[(t * nkv + kv_h) * hd..][..hd];
            for d in 0..hd {
                out[h * hd + d] += e / sum * vv[d];
            }
        }
    }
    out
}

/// Output rows `rows` of a flattened `(tokens, heads, head_dim)` buffer.
pub fn out_rows(out: &[f32], layout: &HeadLayout, rows: Range<usize>) -> Vec<f32> {
    let w = layout.q_width();
    out[rows.start * w..rows.end * w].to_vec()
}
