//! Closed set of operators the network is built from.
//!
//! Every operator maps a rank-4 tensor `(N, C, H, W)` to a rank-4 tensor.
//! Linear layers act on the flattened `C·H·W` features and return
//! `(N, 1, 1, out)`.

use std::fmt;

use burn::prelude::*;
use burn::tensor::activation::{relu, tanh};
use burn::tensor::module::{adaptive_avg_pool2d, avg_pool2d, conv2d, max_pool2d};
use burn::tensor::ops::ConvOptions;
use serde::{Deserialize, Serialize};

/// Pointwise non-linearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationKind {
    /// `max(0, x)`.
    Relu,
    /// Hyperbolic tangent.
    Tanh,
}

/// Pooling flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    /// Average over each window.
    Avg,
    /// Maximum over each window.
    Max,
    /// Average onto a fixed output grid.
    AdaptiveAvg,
}

/// Operator kind, the key relevance rules are dispatched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatorKind {
    /// Placeholder for a raw network input.
    Input,
    /// Dense layer.
    Linear,
    /// 2D convolution.
    Conv,
    /// Pooling.
    Pool(PoolKind),
    /// Pointwise activation.
    Activation(ActivationKind),
    /// Dropout (identity at inference).
    Dropout,
    /// Per-channel affine normalization.
    Normalization,
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorKind::Input => "input",
            OperatorKind::Linear => "linear",
            OperatorKind::Conv => "conv",
            OperatorKind::Pool(PoolKind::Avg) => "avg-pool",
            OperatorKind::Pool(PoolKind::Max) => "max-pool",
            OperatorKind::Pool(PoolKind::AdaptiveAvg) => "adaptive-avg-pool",
            OperatorKind::Activation(ActivationKind::Relu) => "relu",
            OperatorKind::Activation(ActivationKind::Tanh) => "tanh",
            OperatorKind::Dropout => "dropout",
            OperatorKind::Normalization => "normalization",
        };
        f.write_str(name)
    }
}

/// Window of a pooling operator.
///
/// For [`PoolKind::AdaptiveAvg`] `kernel` is the output grid and `stride`
/// is unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    /// Pool flavour.
    pub kind: PoolKind,
    /// Window `[height, width]`.
    pub kernel: [usize; 2],
    /// Stride `[height, width]`.
    pub stride: [usize; 2],
}

impl PoolSpec {
    /// Non-overlapping average pool.
    pub fn avg(kernel: [usize; 2]) -> Self {
        Self {
            kind: PoolKind::Avg,
            kernel,
            stride: kernel,
        }
    }

    /// Non-overlapping max pool.
    pub fn max(kernel: [usize; 2]) -> Self {
        Self {
            kind: PoolKind::Max,
            kernel,
            stride: kernel,
        }
    }

    /// Adaptive average pool onto `output`.
    pub fn adaptive_avg(output: [usize; 2]) -> Self {
        Self {
            kind: PoolKind::AdaptiveAvg,
            kernel: output,
            stride: [1, 1],
        }
    }

    /// Output `[height, width]` for an input of `[height, width]` (floor mode).
    pub fn output_size(&self, input: [usize; 2]) -> [usize; 2] {
        match self.kind {
            PoolKind::AdaptiveAvg => self.kernel,
            PoolKind::Avg | PoolKind::Max => [
                (input[0].saturating_sub(self.kernel[0])) / self.stride[0] + 1,
                (input[1].saturating_sub(self.kernel[1])) / self.stride[1] + 1,
            ],
        }
    }

    fn apply<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.kind {
            PoolKind::Avg => avg_pool2d(x, self.kernel, self.stride, [0, 0], true),
            PoolKind::Max => max_pool2d(x, self.kernel, self.stride, [0, 0], [1, 1]),
            PoolKind::AdaptiveAvg => adaptive_avg_pool2d(x, self.kernel),
        }
    }
}

/// One operator with its parameters.
#[derive(Debug, Clone)]
pub enum Operator<B: Backend> {
    /// Raw input, forwards unchanged.
    Input,
    /// Dense layer with `weight` of shape `[in, out]`.
    Linear {
        /// Weight `[in, out]`.
        weight: Tensor<B, 2>,
        /// Optional bias `[out]`.
        bias: Option<Tensor<B, 1>>,
    },
    /// Convolution with `weight` of shape `[out, in, kh, kw]`.
    Conv {
        /// Kernel weights.
        weight: Tensor<B, 4>,
        /// Optional bias `[out]`.
        bias: Option<Tensor<B, 1>>,
        /// Stride `[height, width]`.
        stride: [usize; 2],
        /// Zero rows prepended on top and zero columns on the left.
        pad: [usize; 2],
    },
    /// Pooling.
    Pool(PoolSpec),
    /// Pointwise activation.
    Activation(ActivationKind),
    /// Dropout, identity at inference.
    Dropout {
        /// Training-time drop probability.
        prob: f64,
    },
    /// `x * scale[c] + shift[c]` per channel.
    Normalization {
        /// Per-channel scale.
        scale: Tensor<B, 1>,
        /// Per-channel shift.
        shift: Tensor<B, 1>,
    },
}

impl<B: Backend> Operator<B> {
    /// Kind of this operator.
    pub fn kind(&self) -> OperatorKind {
        match self {
            Operator::Input => OperatorKind::Input,
            Operator::Linear { .. } => OperatorKind::Linear,
            Operator::Conv { .. } => OperatorKind::Conv,
            Operator::Pool(spec) => OperatorKind::Pool(spec.kind),
            Operator::Activation(kind) => OperatorKind::Activation(*kind),
            Operator::Dropout { .. } => OperatorKind::Dropout,
            Operator::Normalization { .. } => OperatorKind::Normalization,
        }
    }

    /// Inference forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Operator::Input | Operator::Dropout { .. } => x,
            Operator::Linear { weight, bias } => linear(x, weight.clone(), bias.clone()),
            Operator::Conv {
                weight,
                bias,
                stride,
                pad,
            } => convolve(x, weight.clone(), bias.clone(), *stride, *pad),
            Operator::Pool(spec) => spec.apply(x),
            Operator::Activation(ActivationKind::Relu) => relu(x),
            Operator::Activation(ActivationKind::Tanh) => tanh(x),
            Operator::Normalization { scale, shift } => {
                let channels = scale.dims()[0];
                x * scale.clone().reshape([1, channels, 1, 1])
                    + shift.clone().reshape([1, channels, 1, 1])
            }
        }
    }

    /// Forward map used to redistribute relevance.
    ///
    /// Parametric layers drop their bias so that the pre-activations are a
    /// sum of input contributions only; with `z_plus` their weights are
    /// clamped to be non-negative. Other operators forward unchanged.
    pub fn forward_conservative(&self, x: Tensor<B, 4>, z_plus: bool) -> Tensor<B, 4> {
        match self {
            Operator::Linear { weight, .. } => linear(x, positive_part(weight.clone(), z_plus), None),
            Operator::Conv {
                weight,
                stride,
                pad,
                ..
            } => convolve(x, positive_part(weight.clone(), z_plus), None, *stride, *pad),
            _ => self.forward(x),
        }
    }

    /// Number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        let bias_len = |bias: &Option<Tensor<B, 1>>| bias.as_ref().map_or(0, |b| b.dims()[0]);
        match self {
            Operator::Linear { weight, bias } => weight.shape().num_elements() + bias_len(bias),
            Operator::Conv { weight, bias, .. } => weight.shape().num_elements() + bias_len(bias),
            Operator::Normalization { scale, shift } => scale.dims()[0] + shift.dims()[0],
            _ => 0,
        }
    }
}

fn positive_part<B: Backend, const D: usize>(weight: Tensor<B, D>, z_plus: bool) -> Tensor<B, D> {
    if z_plus {
        weight.clamp_min(0.0)
    } else {
        weight
    }
}

fn linear<B: Backend>(
    x: Tensor<B, 4>,
    weight: Tensor<B, 2>,
    bias: Option<Tensor<B, 1>>,
) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    let out = x.reshape([n, c * h * w]).matmul(weight);
    let out = match bias {
        Some(bias) => out + bias.unsqueeze::<2>(),
        None => out,
    };
    let features = out.dims()[1];
    out.reshape([n, 1, 1, features])
}

fn convolve<B: Backend>(
    x: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    bias: Option<Tensor<B, 1>>,
    stride: [usize; 2],
    pad: [usize; 2],
) -> Tensor<B, 4> {
    let x = pad_leading(x, pad);
    conv2d(x, weight, bias, ConvOptions::new(stride, [0, 0], [1, 1], 1))
}

/// Prepend `pad[0]` zero rows and `pad[1]` zero columns.
pub fn pad_leading<B: Backend>(x: Tensor<B, 4>, pad: [usize; 2]) -> Tensor<B, 4> {
    if pad == [0, 0] {
        return x;
    }
    let [n, c, h, w] = x.dims();
    let padded = Tensor::<B, 4>::zeros([n, c, h + pad[0], w + pad[1]], &x.device());
    padded.slice_assign([0..n, 0..c, pad[0]..h + pad[0], pad[1]..w + pad[1]], x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_linear_forward_and_conservative() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 2>::from_floats([[1.0, -1.0], [2.0, 0.5]], &device);
        let bias = Tensor::<TestBackend, 1>::from_floats([10.0, 20.0], &device);
        let op = Operator::Linear {
            weight,
            bias: Some(bias),
        };
        let x = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 2.0]]]], &device);

        assert_eq!(values(op.forward(x.clone())), vec![15.0, 20.0]);
        assert_eq!(values(op.forward_conservative(x.clone(), false)), vec![5.0, 0.0]);
        assert_eq!(values(op.forward_conservative(x, true)), vec![5.0, 1.0]);
    }

    #[test]
    fn test_padded_conv_keeps_width() {
        let device = Default::default();
        let op = Operator::Conv {
            weight: Tensor::<TestBackend, 4>::ones([1, 1, 1, 2], &device),
            bias: None,
            stride: [1, 1],
            pad: [0, 1],
        };
        let x = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 2.0, 3.0]]]], &device);
        let out = op.forward(x);
        assert_eq!(out.dims(), [1, 1, 1, 3]);
        assert_eq!(values(out), vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_pool_floor_mode() {
        let device = Default::default();
        let op = Operator::<TestBackend>::Pool(PoolSpec::avg([1, 2]));
        let x = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 3.0, 5.0, 7.0, 9.0]]]], &device);
        assert_eq!(values(op.forward(x)), vec![2.0, 6.0]);
        assert_eq!(PoolSpec::avg([2, 2]).output_size([3, 30]), [1, 15]);
    }

    #[test]
    fn test_normalization_is_per_channel() {
        let device = Default::default();
        let op = Operator::Normalization {
            scale: Tensor::<TestBackend, 1>::from_floats([2.0, 3.0], &device),
            shift: Tensor::<TestBackend, 1>::from_floats([1.0, 0.0], &device),
        };
        let x = Tensor::<TestBackend, 4>::ones([1, 2, 1, 1], &device);
        assert_eq!(values(op.forward(x)), vec![3.0, 3.0]);
        assert_eq!(op.kind(), OperatorKind::Normalization);
        assert_eq!(op.parameter_count(), 4);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(OperatorKind::Pool(PoolKind::AdaptiveAvg).to_string(), "adaptive-avg-pool");
        assert_eq!(OperatorKind::Activation(ActivationKind::Tanh).to_string(), "tanh");
    }
}
