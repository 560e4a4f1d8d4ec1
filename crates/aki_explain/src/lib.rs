//! # aki_explain
//!
//! Layer-wise relevance propagation (LRP) for the multi-branch AKI
//! classifier.
//!
//! This crate provides:
//! - [`LayerRegistry`] - rule dispatch keyed by operator kind
//! - [`Rule`] - ε / z⁺ rules for parametric layers and pools, identity for
//!   pointwise layers
//! - [`attention_relevance`] - the renormalized attention rule
//! - [`blend`] - the residual merge rule
//! - [`LrpEngine`] - reverse traversal of a recorded [`aki_models::Trace`]
//! - [`RelevanceTable`] - column-named output
//!
//! ## Example
//!
//! ```rust,ignore
//! use aki_explain::{default_rules, ExplainConfig, LrpEngine};
//!
//! type B = burn_autodiff::Autodiff<burn_ndarray::NdArray>;
//!
//! let net = config.init::<B>(&device)?;
//! let rules = default_rules(net.layers());
//! let engine = LrpEngine::new(net.layers().clone(), &rules, ExplainConfig::default())?;
//! let explanation = engine.explain(net.trace(&batch)?)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attention;
mod config;
mod engine;
mod error;
pub mod presets;
mod registry;
pub mod report;
mod residual;
mod rules;

pub use attention::{attention_relevance, renormalize, sample_totals, AttentionRelevance};
pub use config::{ExplainConfig, OutputRelevance};
pub use engine::{AuditEntry, Explanation, InputRelevance, LrpEngine};
pub use error::{ExplainError, Result, RuleError};
pub use presets::default_rules;
pub use registry::{load_rule_descriptions, LayerRegistry, RuleDescription, RULE_KEYS};
pub use report::{RelevanceSign, RelevanceTable};
pub use residual::{blend, PATH_WEIGHT};
pub use rules::{stabilize, Rule, DEFAULT_EPSILON};
