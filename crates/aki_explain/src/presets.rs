//! Default rule list for an [`aki_models::AkiNet`] layer table.

use aki_models::{BranchId, LayerGroup, LayerTable, OperatorKind};
use burn::prelude::*;
use serde_json::json;

use crate::registry::RuleDescription;

/// Stabilizer of the time-series encoder, whose inputs are small.
pub const TIMESERIES_EPSILON: f64 = 2.5e-10;
/// Stabilizer of the residual stacks.
pub const STACK_EPSILON: f64 = 1e-6;
/// Stabilizer everywhere else.
pub const BASE_EPSILON: f64 = 2.5e-7;

fn description(epsilon: f64, z_plus: Option<bool>) -> RuleDescription {
    let mut map = RuleDescription::new();
    map.insert("epsilon".into(), json!(epsilon));
    if let Some(z_plus) = z_plus {
        map.insert("z_plus".into(), json!(z_plus));
    }
    map
}

/// One description per layer of `table`.
///
/// Convolutions use z⁺ everywhere but in the head; pools carry only
/// `epsilon`; pass-through layers get an empty description.
pub fn default_rules<B: Backend>(table: &LayerTable<B>) -> Vec<RuleDescription> {
    table
        .iter()
        .map(|(_, layer)| match (layer.kind(), layer.group) {
            (OperatorKind::Linear | OperatorKind::Conv, LayerGroup::Head) => {
                description(BASE_EPSILON, Some(false))
            }
            (OperatorKind::Linear | OperatorKind::Conv, LayerGroup::ResidualStack(_)) => {
                description(STACK_EPSILON, Some(true))
            }
            (
                OperatorKind::Linear | OperatorKind::Conv,
                LayerGroup::Encoder(BranchId::DynamicTimeseries),
            ) => description(TIMESERIES_EPSILON, Some(true)),
            (OperatorKind::Linear | OperatorKind::Conv, _) => description(BASE_EPSILON, Some(true)),
            (OperatorKind::Pool(_), _) => description(BASE_EPSILON, None),
            _ => RuleDescription::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LayerRegistry;
    use crate::rules::Rule;
    use aki_models::AkiNetConfig;
    use burn_ndarray::NdArray;

    #[test]
    fn test_defaults_bind_to_the_network() {
        let config = AkiNetConfig::default().with_hidden(4).with_head_hidden(4);
        let net = config.init::<NdArray>(&Default::default()).unwrap();
        let table = net.layers();
        let rules = LayerRegistry::new()
            .bind(table, &default_rules(table))
            .unwrap();
        assert_eq!(rules.len(), table.len());

        let rule = |name: &str| table.find(name).map(|id| rules[id.0]);
        assert_eq!(
            rule("dynamic-timeseries.deep.0"),
            Some(Rule::Epsilon {
                epsilon: TIMESERIES_EPSILON,
                z_plus: true
            })
        );
        assert_eq!(
            rule("binary-stack.1.shortcut"),
            Some(Rule::Epsilon {
                epsilon: STACK_EPSILON,
                z_plus: true
            })
        );
        assert_eq!(
            rule("timeseries-stack.pool"),
            Some(Rule::Pooling {
                epsilon: BASE_EPSILON
            })
        );
        assert_eq!(
            rule("head.2"),
            Some(Rule::Epsilon {
                epsilon: BASE_EPSILON,
                z_plus: false
            })
        );
        assert_eq!(rule("flag.merge"), Some(Rule::PassThrough));
    }
}
