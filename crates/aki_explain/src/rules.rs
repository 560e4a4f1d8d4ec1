//! Per-layer relevance rules.
//!
//! Parametric layers and pools redistribute relevance with the ε rule,
//!
//! ```text
//! R_in = A ⊙ ∂/∂A Σ( Z(A) · stop_grad(R_out / stab(Z(A))) )
//! ```
//!
//! where `Z` is the layer's bias-free forward map (weights clamped to
//! `≥ 0` under z⁺) and `stab(z) = z + ε·sign₀(z)` with `sign₀(0) = +1`.
//! The gradient comes from the autodiff backend. Activations, dropout and
//! inputs pass relevance through unchanged.

use aki_models::Operator;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Stabilizer used when a description does not set `epsilon`.
pub const DEFAULT_EPSILON: f64 = 2.5e-7;

/// A resolved relevance rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum Rule {
    /// ε rule for linear and convolution layers.
    Epsilon {
        /// Stabilizer.
        epsilon: f64,
        /// Redistribute through positive weights only.
        z_plus: bool,
    },
    /// ε rule through a pool's own forward map.
    Pooling {
        /// Stabilizer.
        epsilon: f64,
    },
    /// Identity.
    PassThrough,
}

impl Rule {
    /// Whether the rule conserves relevance in closed form.
    pub fn is_conservative(&self) -> bool {
        !matches!(self, Rule::PassThrough)
    }

    /// Relevance at the input of `operator`, given its `input` activation
    /// and the `relevance` at its output.
    pub fn relevance<B: AutodiffBackend>(
        &self,
        operator: &Operator<B>,
        input: &Tensor<B, 4>,
        relevance: Tensor<B, 4>,
    ) -> Result<Tensor<B, 4>, RuleError> {
        match *self {
            Rule::PassThrough => Ok(relevance),
            Rule::Epsilon { epsilon, z_plus } => {
                redistribute(operator, input, relevance, epsilon, z_plus)
            }
            Rule::Pooling { epsilon } => redistribute(operator, input, relevance, epsilon, false),
        }
    }
}

/// `z + ε·sign₀(z)`, never zero for `ε > 0`.
pub fn stabilize<B: Backend, const D: usize>(z: Tensor<B, D>, epsilon: f64) -> Tensor<B, D> {
    let sign = z
        .clone()
        .greater_equal_elem(0.0)
        .float()
        .mul_scalar(2.0)
        .sub_scalar(1.0);
    z + sign.mul_scalar(epsilon)
}

fn redistribute<B: AutodiffBackend>(
    operator: &Operator<B>,
    input: &Tensor<B, 4>,
    relevance: Tensor<B, 4>,
    epsilon: f64,
    z_plus: bool,
) -> Result<Tensor<B, 4>, RuleError> {
    let activation = input.clone().detach();
    let tracked = activation.clone().require_grad();
    let z = operator.forward_conservative(tracked.clone(), z_plus);
    if z.dims() != relevance.dims() {
        return Err(RuleError::ShapeMismatch(format!(
            "relevance {:?} for an output of {:?}",
            relevance.dims(),
            z.dims()
        )));
    }

    let scale = (relevance.detach() / stabilize(z.clone().detach(), epsilon)).detach();
    let grads = (z * scale).sum().backward();
    let contribution = tracked
        .grad(&grads)
        .map(Tensor::<B, 4>::from_inner)
        .unwrap_or_else(|| Tensor::zeros(activation.dims(), &activation.device()));
    Ok(activation * contribution)
}
