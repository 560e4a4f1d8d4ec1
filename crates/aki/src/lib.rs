//! # aki
//!
//! Layer-wise relevance propagation (LRP) for the multi-branch AKI
//! classifier.
//!
//! A forward pass over the five patient inputs is recorded as a
//! [`Trace`](aki_models::Trace); the [`LrpEngine`](aki_explain::LrpEngine)
//! walks it in reverse and returns one relevance map per input, which
//! [`RelevanceTable`](aki_explain::RelevanceTable) names column by column.
//!
//! - **Core**: feature layout, input batches, column metadata
//! - **Models**: the classifier, its layer table and parameter snapshots
//! - **Explain**: rule registry, relevance rules, engine, report
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use aki::prelude::*;
//!
//! type B = burn_autodiff::Autodiff<burn_ndarray::NdArray>;
//!
//! let config = AkiNetConfig::default();
//! let net = config.init::<B>(&device)?;
//! let engine = LrpEngine::new(
//!     net.layers().clone(),
//!     &default_rules(net.layers()),
//!     ExplainConfig::default(),
//! )?;
//!
//! let arrays = InputArrays::synthetic(&config.layout, 4, Seed::new(42));
//! let batch = InputBatch::from_arrays(&arrays, &config.layout, &device)?;
//! let explanation = engine.explain(net.trace(&batch)?)?;
//!
//! let columns = FeatureColumns::placeholder(&config.layout);
//! let table = RelevanceTable::build(
//!     &explanation.relevance,
//!     &columns,
//!     &config.layout,
//!     RelevanceSign::Absolute,
//! )?;
//! ```
//!
//! ## Feature Flags
//!
//! - `backend-ndarray` (default): CPU backend using ndarray

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub use aki_core as core;
pub use aki_explain as explain;
pub use aki_models as models;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use aki::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use aki_core::{FeatureColumns, FeatureLayout, InputArrays, InputBatch, InputName, Seed};

    // Models
    pub use aki_models::{AkiNet, AkiNetConfig, LayerTable, OperatorKind, ParameterSnapshot, Trace};

    // Explain
    pub use aki_explain::{
        default_rules, load_rule_descriptions, ExplainConfig, ExplainError, Explanation,
        InputRelevance, LrpEngine, OutputRelevance, RelevanceSign, RelevanceTable,
        RuleDescription,
    };
}

/// All module for importing everything.
pub mod all {
    pub use super::prelude::*;

    pub use aki_core::backend;
    pub use aki_explain::{
        attention_relevance, blend, AuditEntry, LayerRegistry, Rule, RuleError, DEFAULT_EPSILON,
    };
    pub use aki_models::{BranchId, FusionPoint, LayerGroup, Operator};
}
