//! # aki_core
//!
//! Core types shared by the AKI relevance-propagation crates.
//!
//! This crate provides:
//! - [`Seed`] for deterministic parameter streams and synthetic inputs
//! - [`FeatureLayout`] and [`InputName`] describing the five model inputs
//! - [`InputArrays`] (host arrays) and [`InputBatch`] (burn tensors)
//! - [`FeatureColumns`] naming every scalar of a relevance map
//! - Error types
//!
//! ## Shape Convention
//!
//! Every input is consumed as a rank-4 tensor `(N, C, H, W)`:
//! - `N`: batch size
//! - `C`: feature channels
//! - `H`: statistic rows (1 for inputs without rows)
//! - `W`: slots (three per day), or info features for the patient-info input
//!
//! ## Example
//!
//! ```rust,ignore
//! use aki_core::{FeatureLayout, InputArrays, Seed};
//!
//! let layout = FeatureLayout::default();
//! let inputs = InputArrays::synthetic(&layout, 8, Seed::new(42));
//! assert_eq!(inputs.validate(&layout)?, 8);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod batch;
mod columns;
mod error;
mod seed;
mod shape;

pub use batch::{tensor_from_vec, tensor_to_array, InputArrays, InputBatch};
pub use columns::{slot_prefix, FeatureColumns};
pub use error::{CoreError, Result};
pub use seed::Seed;
pub use shape::{FeatureLayout, InputName};

/// Backend type aliases for convenience
pub mod backend {
    #[cfg(feature = "backend-ndarray")]
    pub use burn_ndarray::NdArray;
}
