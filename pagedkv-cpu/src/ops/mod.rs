//! CPU implementations of the backend op traits.

pub mod context;
pub mod decode;
pub mod kv_store;
pub mod softmax_reduce;

use pagedkv::dtype::CacheScalar;

/// `scale * (q . k)` with `k` widened to f32.
#[inline]
pub(crate) fn scaled_dot<T: CacheScalar>(q: &[f32], k: &[T], scale: f32) -> f32 {
    q.iter()
        .zip(k)
        .map(|(&a, &b)| a * b.to_f32())
        .sum::<f32>()
        * scale
}
