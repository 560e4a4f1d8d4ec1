//! Relevance through scaled dot-product attention.
//!
//! Attention has no exact closed-form LRP rule. The approximation below
//! splits the output relevance onto the value path and, through the
//! attention weights, onto the query and key paths, then rescales each of
//! the three maps so that every sample's total matches the output
//! relevance of that sample.

use aki_models::AttentionTrace;
use burn::prelude::*;
use tracing::{debug, warn, Level};

use crate::error::RuleError;

/// Relevance of the three attention operands, each shaped like its operand.
#[derive(Debug, Clone)]
pub struct AttentionRelevance<B: Backend> {
    /// Relevance of the queries.
    pub query: Tensor<B, 4>,
    /// Relevance of the keys.
    pub key: Tensor<B, 4>,
    /// Relevance of the values.
    pub value: Tensor<B, 4>,
    /// Samples whose maps were spread uniformly because their total was
    /// below the floor.
    pub degenerate: usize,
}

/// Per-sample totals `(N,)` of a rank-4 tensor.
pub fn sample_totals<B: Backend>(t: Tensor<B, 4>) -> Tensor<B, 1> {
    let [n, c, h, w] = t.dims();
    t.reshape([n, c * h * w]).sum_dim(1).reshape([n])
}

/// Rescale each sample of `relevance` so that its total equals `target`.
///
/// A sample whose total is below `floor` in magnitude cannot be rescaled;
/// its target is spread uniformly over its entries instead. Returns the
/// rescaled map and the number of such samples. Per-sample factors are
/// logged at debug level under `operand`.
pub fn renormalize<B: Backend>(
    operand: &str,
    relevance: Tensor<B, 4>,
    target: Tensor<B, 1>,
    floor: f64,
) -> (Tensor<B, 4>, usize) {
    let [n, c, h, w] = relevance.dims();
    let entries = (c * h * w) as f64;
    let total = sample_totals(relevance.clone());
    if tracing::enabled!(Level::DEBUG) {
        log_factors(operand, &total, &target, floor);
    }
    let small = total.clone().abs().lower_elem(floor).float();
    let keep = small.clone().neg().add_scalar(1.0);
    let safe = total + small.clone();
    let factor = (target.clone() * keep / safe).reshape([n, 1, 1, 1]);
    let spread = (target * small.clone()).div_scalar(entries).reshape([n, 1, 1, 1]);
    let degenerate: f32 = small.sum().into_scalar().elem();
    (relevance * factor + spread, degenerate.round() as usize)
}

fn host<B: Backend>(t: &Tensor<B, 1>) -> Option<Vec<f32>> {
    t.clone().into_data().convert::<f32>().to_vec::<f32>().ok()
}

fn log_factors<B: Backend>(operand: &str, total: &Tensor<B, 1>, target: &Tensor<B, 1>, floor: f64) {
    let (Some(totals), Some(targets)) = (host(total), host(target)) else {
        return;
    };
    for (sample, (total, target)) in totals.into_iter().zip(targets).enumerate() {
        if f64::from(total.abs()) < floor {
            debug!(operand, sample, total, target, "attention relevance spread uniformly");
        } else {
            debug!(
                operand,
                sample,
                total,
                target,
                factor = target / total,
                "attention relevance renormalized"
            );
        }
    }
}

/// Redistribute `relevance` at the attention output onto its operands.
///
/// `relevance` has the shape of the attention output `(N, C, Lq, Dv)`.
/// When the weight-relevance width differs from the weights', it is
/// repeated along the last axis if the width divides evenly; keys stored
/// transposed are detected from their last axis. Anything else is a
/// [`RuleError::ShapeMismatch`].
pub fn attention_relevance<B: Backend>(
    relevance: Tensor<B, 4>,
    attention: &AttentionTrace<B>,
    floor: f64,
) -> Result<AttentionRelevance<B>, RuleError> {
    let AttentionTrace {
        query,
        key,
        value,
        weights,
    } = attention;
    let weight_dims = weights.dims();
    let value_dims = value.dims();
    if relevance.dims()[..3] != weight_dims[..3] {
        return Err(RuleError::ShapeMismatch(format!(
            "attention output relevance {:?} for weights {weight_dims:?}",
            relevance.dims()
        )));
    }
    if relevance.dims()[3] != value_dims[3] {
        return Err(RuleError::ShapeMismatch(format!(
            "attention output relevance {:?} for values {value_dims:?}",
            relevance.dims()
        )));
    }
    let target = sample_totals(relevance.clone());

    let r_value = weights.clone().transpose().matmul(relevance.clone());

    let mut r_weights = relevance.matmul(value.clone().transpose());
    let width = r_weights.dims()[3];
    if width != weight_dims[3] {
        if width == 0 || weight_dims[3] % width != 0 {
            return Err(RuleError::ShapeMismatch(format!(
                "weight relevance width {width} does not divide weight width {}",
                weight_dims[3]
            )));
        }
        debug!(from = width, to = weight_dims[3], "repeating weight relevance");
        r_weights = r_weights.repeat_dim(3, weight_dims[3] / width);
    }
    let r_scores = r_weights * weights.clone();

    let key_dims = key.dims();
    let transposed = if r_scores.dims()[3] == key_dims[2] {
        false
    } else if r_scores.dims()[3] == key_dims[3] {
        true
    } else {
        return Err(RuleError::ShapeMismatch(format!(
            "scores of width {} for keys {key_dims:?}",
            r_scores.dims()[3]
        )));
    };
    let key_rows = if transposed {
        key.clone().transpose()
    } else {
        key.clone()
    };
    if key_rows.dims()[3] != query.dims()[3] {
        return Err(RuleError::ShapeMismatch(format!(
            "keys {key_dims:?} for queries {:?}",
            query.dims()
        )));
    }

    let r_query = r_scores.clone().matmul(key_rows);
    let r_key = r_scores.transpose().matmul(query.clone());
    let r_key = if transposed { r_key.transpose() } else { r_key };

    let (query, dq) = renormalize("query", r_query, target.clone(), floor);
    let (key, dk) = renormalize("key", r_key, target.clone(), floor);
    let (value, dv) = renormalize("value", r_value, target, floor);
    let degenerate = dq.max(dk).max(dv);
    if degenerate > 0 {
        warn!(
            samples = degenerate,
            floor, "attention relevance below floor, spread uniformly"
        );
    }
    Ok(AttentionRelevance {
        query,
        key,
        value,
        degenerate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aki_models::scaled_dot_product_attention;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    fn tensor(values: &[f32], dims: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::<TestBackend, 1>::from_floats(values, &Default::default()).reshape(dims)
    }

    fn totals(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        sample_totals(t).into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn ramp(dims: [usize; 4], scale: f32) -> Tensor<TestBackend, 4> {
        let count = dims.iter().product::<usize>();
        let values: Vec<f32> = (0..count).map(|i| ((i % 7) as f32 + 1.0) * scale).collect();
        tensor(&values, dims)
    }

    fn assert_close(got: Vec<f32>, expected: &[f32]) {
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-4 * e.abs().max(1.0), "{got:?} != {expected:?}");
        }
    }

    #[test]
    fn test_renormalize_per_sample() {
        let r = tensor(&[1.0, 1.0, 2.0, 2.0], [2, 1, 1, 2]);
        let target = Tensor::<TestBackend, 1>::from_floats([4.0, -1.0], &Default::default());
        let (out, degenerate) = renormalize("value", r, target, 1e-12);
        assert_eq!(degenerate, 0);
        let values = out.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_close(values, &[2.0, 2.0, -0.25, -0.25]);
    }

    #[test]
    fn test_renormalize_spreads_degenerate_sample() {
        let r = tensor(&[1.0, -1.0, 0.5, 0.5], [2, 1, 1, 2]);
        let target = Tensor::<TestBackend, 1>::from_floats([3.0, 2.0], &Default::default());
        let (out, degenerate) = renormalize("value", r, target, 1e-12);
        assert_eq!(degenerate, 1);
        let values = out.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_close(values, &[1.5, 1.5, 1.0, 1.0]);
    }

    #[test]
    fn test_renormalize_can_flip_the_sign() {
        let r = tensor(&[0.1, 0.2, 0.5, 0.5], [2, 1, 1, 2]);
        let target = Tensor::<TestBackend, 1>::from_floats([-0.03, -0.5], &Default::default());
        let (out, degenerate) = renormalize("key", r, target, 1e-12);
        assert_eq!(degenerate, 0);
        assert_close(totals(out.clone()), &[-0.03, -0.5]);
        let values = out.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| *v < 0.0), "{values:?}");
        assert_close(values, &[-0.01, -0.02, -0.25, -0.25]);
    }

    #[test]
    fn test_totals_match_output_relevance() {
        let x = ramp([2, 3, 4, 5], 0.3);
        let (out, weights) = scaled_dot_product_attention(x.clone(), x.clone(), x.clone());
        let attention = AttentionTrace {
            query: x.clone(),
            key: x.clone(),
            value: x,
            weights,
        };
        let relevance = ramp(out.dims(), 0.1);
        let expected = totals(relevance.clone());

        let r = attention_relevance(relevance, &attention, 1e-12).unwrap();
        assert_eq!(r.query.dims(), [2, 3, 4, 5]);
        assert_eq!(r.key.dims(), [2, 3, 4, 5]);
        assert_eq!(r.value.dims(), [2, 3, 4, 5]);
        assert_close(totals(r.query), &expected);
        assert_close(totals(r.key), &expected);
        assert_close(totals(r.value), &expected);
    }

    #[test]
    fn test_cross_attention_key_keeps_key_shape() {
        let q = ramp([1, 2, 3, 4], 0.2);
        let k = ramp([1, 2, 3, 4], -0.1);
        let (out, weights) = scaled_dot_product_attention(q.clone(), k.clone(), q.clone());
        let attention = AttentionTrace {
            query: q.clone(),
            key: k.clone(),
            value: q,
            weights,
        };
        let relevance = ramp(out.dims(), 0.05);
        let expected = totals(relevance.clone());
        let r = attention_relevance(relevance, &attention, 1e-12).unwrap();
        assert_eq!(r.key.dims(), k.dims());
        assert_close(totals(r.key), &expected);
    }

    #[test]
    fn test_narrow_weight_relevance_is_repeated() {
        let query = ramp([1, 1, 2, 3], 0.2);
        let key = ramp([1, 1, 4, 3], 0.3);
        let value = ramp([1, 1, 2, 3], 0.1);
        let weights = burn::tensor::activation::softmax(ramp([1, 1, 2, 4], 0.5), 3);
        let attention = AttentionTrace {
            query,
            key: key.clone(),
            value,
            weights,
        };
        let relevance = ramp([1, 1, 2, 3], 0.2);
        let expected = totals(relevance.clone());
        let r = attention_relevance(relevance, &attention, 1e-12).unwrap();
        assert_eq!(r.query.dims(), [1, 1, 2, 3]);
        assert_eq!(r.key.dims(), key.dims());
        assert_close(totals(r.query), &expected);
        assert_close(totals(r.key), &expected);
    }

    #[test]
    fn test_transposed_key_is_reconciled() {
        let x = ramp([1, 1, 3, 2], 0.4);
        let (out, weights) = scaled_dot_product_attention(x.clone(), x.clone(), x.clone());
        let key_t = x.clone().transpose();
        let attention = AttentionTrace {
            query: x.clone(),
            key: key_t.clone(),
            value: x,
            weights,
        };
        let relevance = ramp(out.dims(), 0.1);
        let expected = totals(relevance.clone());
        let r = attention_relevance(relevance, &attention, 1e-12).unwrap();
        assert_eq!(r.key.dims(), key_t.dims());
        assert_eq!(r.degenerate, 0);
        assert_close(totals(r.query), &expected);
        assert_close(totals(r.key), &expected);
        assert_close(totals(r.value), &expected);
    }

    #[test]
    fn test_unreconcilable_key_fails() {
        let x = ramp([1, 1, 3, 2], 0.4);
        let (out, weights) = scaled_dot_product_attention(x.clone(), x.clone(), x.clone());
        let attention = AttentionTrace {
            query: x.clone(),
            key: ramp([1, 1, 5, 5], 0.1),
            value: x,
            weights,
        };
        let err = attention_relevance(ramp(out.dims(), 0.1), &attention, 1e-12).unwrap_err();
        assert!(matches!(err, RuleError::ShapeMismatch(_)));
    }
}
