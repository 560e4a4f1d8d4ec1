//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How the output relevance is seeded at the logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputRelevance {
    /// Every sample starts with `1 / N`.
    #[default]
    BatchUniform,
    /// Every sample starts with its predicted probability.
    Prediction,
}

/// Configuration for [`crate::LrpEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainConfig {
    /// Seeding of the output relevance.
    pub output_relevance: OutputRelevance,
    /// Totals below this magnitude are not rescaled by attention renormalization.
    pub renorm_floor: f64,
    /// Record per-layer totals.
    pub audit: bool,
    /// Relative drift above which an audited layer is logged.
    pub audit_tolerance: f64,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            output_relevance: OutputRelevance::BatchUniform,
            renorm_floor: 1e-12,
            audit: false,
            audit_tolerance: 1e-3,
        }
    }
}

impl ExplainConfig {
    /// Set the output seeding.
    #[must_use]
    pub fn with_output_relevance(mut self, output_relevance: OutputRelevance) -> Self {
        self.output_relevance = output_relevance;
        self
    }

    /// Set the renormalization floor.
    #[must_use]
    pub fn with_renorm_floor(mut self, renorm_floor: f64) -> Self {
        self.renorm_floor = renorm_floor;
        self
    }

    /// Enable or disable the conservation audit.
    #[must_use]
    pub fn with_audit(mut self, audit: bool) -> Self {
        self.audit = audit;
        self
    }

    /// Set the audit tolerance.
    #[must_use]
    pub fn with_audit_tolerance(mut self, audit_tolerance: f64) -> Self {
        self.audit_tolerance = audit_tolerance;
        self
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
