//! Rule dispatch keyed by operator kind.
//!
//! A rule description is a JSON object over the closed key set
//! `{z_plus, epsilon}`. The registry turns descriptions into [`Rule`]s
//! before any tensor work, so unknown operators and bad keys surface at
//! load time.
//!
//! # Example
//!
//! ```rust,ignore
//! use aki_explain::{LayerRegistry, RuleDescription};
//! use aki_models::OperatorKind;
//! use serde_json::json;
//!
//! let registry = LayerRegistry::new();
//! let config: RuleDescription = serde_json::from_value(json!({"epsilon": 1e-6, "z_plus": true}))?;
//! let rule = registry.resolve(OperatorKind::Conv, &config)?;
//! ```

use std::path::Path;

use aki_models::{LayerTable, OperatorKind};
use burn::prelude::*;
use serde_json::Value;
use tracing::debug;

use crate::error::{ExplainError, Result, RuleError};
use crate::rules::{Rule, DEFAULT_EPSILON};

/// Rule configuration of one layer.
pub type RuleDescription = serde_json::Map<String, Value>;

/// Keys a rule description may carry.
pub const RULE_KEYS: [&str; 2] = ["z_plus", "epsilon"];

/// Load an ordered rule list from a JSON array.
pub fn load_rule_descriptions(path: impl AsRef<Path>) -> Result<Vec<RuleDescription>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Resolves rule descriptions against operator kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerRegistry;

impl LayerRegistry {
    /// Create the registry.
    pub fn new() -> Self {
        Self
    }

    /// Whether `kind` has a registered rule.
    pub fn supports(&self, kind: OperatorKind) -> bool {
        !matches!(kind, OperatorKind::Normalization)
    }

    /// Resolve the rule for one layer.
    pub fn resolve(
        &self,
        kind: OperatorKind,
        config: &RuleDescription,
    ) -> std::result::Result<Rule, RuleError> {
        if !self.supports(kind) {
            return Err(RuleError::UnsupportedOperator(kind));
        }
        if let Some(key) = config.keys().find(|k| !RULE_KEYS.contains(&k.as_str())) {
            return Err(RuleError::InvalidRuleConfig(format!("unknown key '{key}'")));
        }
        let epsilon = match config.get("epsilon") {
            None => DEFAULT_EPSILON,
            Some(value) => match value.as_f64() {
                Some(eps) if eps.is_finite() && eps > 0.0 => eps,
                _ => {
                    return Err(RuleError::InvalidRuleConfig(format!(
                        "epsilon must be a positive finite number, got {value}"
                    )))
                }
            },
        };
        let z_plus = match config.get("z_plus") {
            None => None,
            Some(Value::Bool(flag)) => Some(*flag),
            Some(value) => {
                return Err(RuleError::InvalidRuleConfig(format!(
                    "z_plus must be a boolean, got {value}"
                )))
            }
        };

        match kind {
            OperatorKind::Linear | OperatorKind::Conv => Ok(Rule::Epsilon {
                epsilon,
                z_plus: z_plus.unwrap_or(false),
            }),
            OperatorKind::Pool(_) => match z_plus {
                Some(_) => Err(RuleError::InvalidRuleConfig(
                    "pooling rules accept only epsilon".into(),
                )),
                None => Ok(Rule::Pooling { epsilon }),
            },
            OperatorKind::Input | OperatorKind::Activation(_) | OperatorKind::Dropout => {
                Ok(Rule::PassThrough)
            }
            OperatorKind::Normalization => Err(RuleError::UnsupportedOperator(kind)),
        }
    }

    /// Resolve one rule per layer of `table`, in order.
    ///
    /// The count check runs first; errors name the offending layer.
    pub fn bind<B: Backend>(
        &self,
        table: &LayerTable<B>,
        rules: &[RuleDescription],
    ) -> Result<Vec<Rule>> {
        if table.len() != rules.len() {
            return Err(ExplainError::LayerCountMismatch {
                layers: table.len(),
                rules: rules.len(),
            });
        }
        let resolved = table
            .iter()
            .zip(rules)
            .map(|((_, layer), config)| {
                self.resolve(layer.kind(), config).map_err(|e| match e {
                    RuleError::UnsupportedOperator(kind) => ExplainError::UnsupportedOperator {
                        layer: layer.name.clone(),
                        kind,
                    },
                    RuleError::InvalidRuleConfig(reason) | RuleError::ShapeMismatch(reason) => {
                        ExplainError::InvalidRuleConfig {
                            layer: layer.name.clone(),
                            reason,
                        }
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(layers = resolved.len(), "bound relevance rules");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aki_models::{ActivationKind, LayerGroup, Operator, PoolKind};
    use burn_ndarray::NdArray;
    use serde_json::json;

    fn description(value: Value) -> RuleDescription {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_resolve_defaults() {
        let registry = LayerRegistry::new();
        let rule = registry
            .resolve(OperatorKind::Conv, &RuleDescription::new())
            .unwrap();
        assert_eq!(
            rule,
            Rule::Epsilon {
                epsilon: DEFAULT_EPSILON,
                z_plus: false
            }
        );
        let rule = registry
            .resolve(
                OperatorKind::Activation(ActivationKind::Relu),
                &description(json!({"z_plus": true})),
            )
            .unwrap();
        assert_eq!(rule, Rule::PassThrough);
    }

    #[test]
    fn test_resolve_rejects_bad_config() {
        let registry = LayerRegistry::new();
        let cases = [
            json!({"alpha": 1.0}),
            json!({"epsilon": 0.0}),
            json!({"epsilon": -1e-6}),
            json!({"epsilon": "small"}),
            json!({"z_plus": 1}),
        ];
        for case in cases {
            let err = registry
                .resolve(OperatorKind::Linear, &description(case.clone()))
                .unwrap_err();
            assert!(matches!(err, RuleError::InvalidRuleConfig(_)), "{case}");
        }
    }

    #[test]
    fn test_pool_rejects_z_plus() {
        let registry = LayerRegistry::new();
        let kind = OperatorKind::Pool(PoolKind::Max);
        assert!(matches!(
            registry.resolve(kind, &description(json!({"z_plus": false}))),
            Err(RuleError::InvalidRuleConfig(_))
        ));
        assert_eq!(
            registry
                .resolve(kind, &description(json!({"epsilon": 1e-3})))
                .unwrap(),
            Rule::Pooling { epsilon: 1e-3 }
        );
    }

    #[test]
    fn test_normalization_is_unsupported() {
        let registry = LayerRegistry::new();
        assert_eq!(
            registry.resolve(OperatorKind::Normalization, &RuleDescription::new()),
            Err(RuleError::UnsupportedOperator(OperatorKind::Normalization))
        );
    }

    #[test]
    fn test_bind_checks_count_first() {
        let mut table = LayerTable::<NdArray>::new();
        table.push(
            "head.1",
            LayerGroup::Head,
            Operator::Activation(ActivationKind::Relu),
        );
        table.push(
            "head.norm",
            LayerGroup::Head,
            Operator::Normalization {
                scale: Tensor::ones([1], &Default::default()),
                shift: Tensor::zeros([1], &Default::default()),
            },
        );
        let registry = LayerRegistry::new();

        let err = registry.bind(&table, &[RuleDescription::new()]).unwrap_err();
        assert!(matches!(
            err,
            ExplainError::LayerCountMismatch { layers: 2, rules: 1 }
        ));

        let err = registry
            .bind(&table, &[RuleDescription::new(), RuleDescription::new()])
            .unwrap_err();
        assert!(matches!(err, ExplainError::UnsupportedOperator { ref layer, .. } if layer == "head.norm"));
    }
}
