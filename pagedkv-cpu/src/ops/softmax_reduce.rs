//! Softmax and value reduction.
//!
//! [`fused_softmax_reduce`] is the single-pass form used by every kernel:
//! a running max and running denominator rescale the accumulator whenever a
//! larger score shows up, so no probability vector is materialised.
//! [`softmax`] and [`weighted_sum`] are the two-pass reference it must match.

use pagedkv::dtype::CacheScalar;

/// Single-pass softmax over `scores` fused with the weighted sum of values.
///
/// `value(j)` yields the value vector paired with `scores[j]`. On return
/// `out` holds `sum_j softmax(scores)_j * value(j)` and the function returns
/// the log-sum-exp of `scores`, or `-inf` when there is nothing to attend to
/// (then `out` is all zeros).
#[allow(clippy::needless_range_loop)]
pub fn fused_softmax_reduce<'a, T, F>(scores: &[f32], value: F, out: &mut [f32]) -> f32
where
    T: CacheScalar + 'a,
    F: Fn(usize) -> &'a [T],
{
    out.fill(0.0);
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f32;

    for (j, &score) in scores.iter().enumerate() {
        if score == f32::NEG_INFINITY {
            continue;
        }
        let new_max = max.max(score);
        let correction = (max - new_max).exp();
        let p = (score - new_max).exp();
        sum = sum * correction + p;
        let v = value(j);
        for d in 0..out.len() {
            out[d] = out[d] * correction + p * v[d].to_f32();
        }
        max = new_max;
    }

    if sum > 0.0 {
        for o in out.iter_mut() {
            *o /= sum;
        }
        max + sum.ln()
    } else {
        f32::NEG_INFINITY
    }
}

/// Max-subtracted softmax.
#[must_use]
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max_score = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = scores.iter().map(|&s| (s - max_score).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in &mut probs {
            *p /= sum;
        }
    }
    probs
}

/// `out = sum_j probs[j] * value(j)`.
#[allow(clippy::needless_range_loop)]
pub fn weighted_sum<'a, T, F>(probs: &[f32], value: F, out: &mut [f32])
where
    T: CacheScalar + 'a,
    F: Fn(usize) -> &'a [T],
{
    out.fill(0.0);
    for (j, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            let v = value(j);
            for d in 0..out.len() {
                out[d] += p * v[d].to_f32();
            }
        }
    }
}

/// Merge partial attention outputs by their log-sum-exp.
///
/// `partials` is `(n, head_dim)` flattened and `lses` has `n` entries; each
/// partial is weighted by `exp(lse_i - max_lse)` and the result renormalised.
pub fn combine_partials(partials: &[f32], lses: &[f32], out: &mut [f32]) {
    let head_dim = out.len();
    out.fill(0.0);
    let max_lse = lses.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_lse == f32::NEG_INFINITY {
        return;
    }

    let mut w_sum = 0.0f32;
    for (i, &lse) in lses.iter().enumerate() {
        let w = (lse - max_lse).exp();
        w_sum += w;
        let part = &partials[i * head_dim..(i + 1) * head_dim];
        for (o, &p) in out.iter_mut().zip(part) {
            *o += w * p;
        }
    }
    for o in out.iter_mut() {
        *o /= w_sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < tol, "index {i}: {x} vs {y}");
        }
    }

    fn values() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 0.0, -1.0],
            vec![0.5, 2.0, 0.0],
            vec![-3.0, 1.0, 4.0],
            vec![0.0, 0.0, 1.0],
        ]
    }

    #[test]
    fn test_fused_matches_reference() {
        let scores = [0.3, 2.5, -1.0, 7.0];
        let vals = values();

        let mut fused = vec![0.0; 3];
        let lse = fused_softmax_reduce(&scores, |j| vals[j].as_slice(), &mut fused);

        let probs = softmax(&scores);
        let mut reference = vec![0.0; 3];
        weighted_sum(&probs, |j| vals[j].as_slice(), &mut reference);

        assert_close(&fused, &reference, 1e-5);
        let expected_lse = scores.iter().map(|s| s.exp()).sum::<f32>().ln();
        assert!((lse - expected_lse).abs() < 1e-4);
    }

    #[test]
    fn test_fused_handles_large_scores() {
        // Naive exp would overflow
        let scores = [1000.0, 1001.0];
        let vals = [vec![0.0f32], vec![1.0f32]];
        let mut out = vec![0.0; 1];
        let lse = fused_softmax_reduce(&scores, |j| vals[j].as_slice(), &mut out);
        let p1 = 1.0 / (1.0 + (-1.0f32).exp());
        assert!((out[0] - p1).abs() < 1e-5);
        assert!(lse.is_finite());
    }

    #[test]
    fn test_empty_scores() {
        let mut out = vec![1.0; 2];
        let lse = fused_softmax_reduce::<f32, _>(&[], |_| &[], &mut out);
        assert_eq!(lse, f32::NEG_INFINITY);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_combine_partials_matches_full() {
        let scores = [0.3, 2.5, -1.0, 7.0];
        let vals = values();

        let mut full = vec![0.0; 3];
        fused_softmax_reduce(&scores, |j| vals[j].as_slice(), &mut full);

        let mut partials = vec![0.0; 6];
        let lse_a = fused_softmax_reduce(&scores[..3], |j| vals[j].as_slice(), &mut partials[..3]);
        let lse_b =
            fused_softmax_reduce(&scores[3..], |j| vals[3 + j].as_slice(), &mut partials[3..]);

        let mut combined = vec![0.0; 3];
        combine_partials(&partials, &[lse_a, lse_b], &mut combined);
        assert_close(&combined, &full, 1e-5);
    }

    #[test]
    fn test_combine_ignores_empty_partials() {
        let partials = [2.0, 4.0, 9.0, 9.0];
        let mut out = vec![0.0; 2];
        combine_partials(&partials, &[0.5, f32::NEG_INFINITY], &mut out);
        assert_close(&out, &[2.0, 4.0], 1e-6);
    }
}
