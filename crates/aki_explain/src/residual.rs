//! Relevance at a residual merge.

use burn::prelude::*;

/// Weight of each path in [`blend`].
pub const PATH_WEIGHT: f64 = 0.5;

/// `0.5·deep + 0.5·shortcut`.
///
/// Both paths receive the full relevance of the block output and are
/// propagated independently; their input relevances are averaged.
pub fn blend<B: Backend>(deep: Tensor<B, 4>, shortcut: Tensor<B, 4>) -> Tensor<B, 4> {
    deep.mul_scalar(PATH_WEIGHT) + shortcut.mul_scalar(PATH_WEIGHT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_blend_is_elementwise_average() {
        let device = Default::default();
        let deep = Tensor::<TestBackend, 1>::from_floats([1.0, -3.0, 0.25, 8.0], &device)
            .reshape([1, 2, 1, 2]);
        let shortcut = Tensor::<TestBackend, 1>::from_floats([3.0, 1.0, -0.25, 0.0], &device)
            .reshape([1, 2, 1, 2]);
        let out = blend(deep, shortcut)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(out, vec![2.0, -1.0, 0.0, 4.0]);
    }
}
