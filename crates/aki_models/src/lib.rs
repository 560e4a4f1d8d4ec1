//! # aki_models
//!
//! Forward pass of the multi-branch AKI classifier, recorded for relevance
//! propagation.
//!
//! This crate provides:
//! - [`Operator`] - the closed set of operators, with a bias-free
//!   conservative forward map
//! - [`LayerTable`] - named layers in recording order
//! - [`AkiNet`] - the network, built from [`AkiNetConfig`]
//! - [`Trace`] - per-branch activation chains, residual block records and
//!   attention checkpoints, built append-only through [`TraceBuilder`]
//! - [`ParameterSnapshot`] - trained parameters as JSON
//!
//! ## Example
//!
//! ```rust,ignore
//! use aki_core::{InputArrays, InputBatch, Seed};
//! use aki_models::AkiNetConfig;
//!
//! let config = AkiNetConfig::default();
//! let net = config.init::<NdArray>(&device)?;
//! let arrays = InputArrays::synthetic(&config.layout, 4, Seed::new(1));
//! let batch = InputBatch::from_arrays(&arrays, &config.layout, &device)?;
//! let trace = net.trace(&batch)?;
//! assert_eq!(trace.logits().dims(), [4, 1]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub mod layers;
pub mod network;
pub mod operator;
pub mod snapshot;
pub mod trace;

pub use error::{ModelError, Result};
pub use layers::{LayerGroup, LayerId, LayerTable, NamedLayer};
pub use network::{scaled_dot_product_attention, AkiNet, AkiNetConfig, ResidualBlock};
pub use operator::{pad_leading, ActivationKind, Operator, OperatorKind, PoolKind, PoolSpec};
pub use snapshot::{LayerParameters, ParameterSnapshot};
pub use trace::{
    AttentionPart, AttentionTrace, BranchId, BranchRecorder, BranchSource, BranchTrace,
    FusionKind, FusionPoint, FusionTrace, InputSlot, Operand, ResidualTrace, Step, Trace,
    TraceBuilder, TraceParts,
};
