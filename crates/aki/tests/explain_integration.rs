//! Integration tests for relevance propagation through the full network.
//!
//! These tests run the classifier on a small layout and explain synthetic
//! batches end to end.

use std::collections::BTreeMap;

use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use ndarray::Array4;

use aki::all::*;

type ExplainBackend = Autodiff<NdArray>;

fn layout() -> FeatureLayout {
    FeatureLayout {
        drug_features: 3,
        info_features: 4,
        timeseries_features: 2,
        dynamic_other_features: 2,
        slots: 6,
        slots_per_day: 3,
        stat_rows: 3,
    }
}

fn config(seed: u64) -> AkiNetConfig {
    AkiNetConfig::new(layout())
        .with_hidden(4)
        .with_head_hidden(8)
        .with_seed(Seed::new(seed))
}

fn network(seed: u64) -> AkiNet<ExplainBackend> {
    config(seed).init(&Default::default()).unwrap()
}

fn batch(arrays: &InputArrays) -> InputBatch<ExplainBackend> {
    InputBatch::from_arrays(arrays, &layout(), &Default::default()).unwrap()
}

fn engine(net: &AkiNet<ExplainBackend>, config: ExplainConfig) -> LrpEngine<ExplainBackend> {
    LrpEngine::new(net.layers().clone(), &default_rules(net.layers()), config).unwrap()
}

fn explain(
    net: &AkiNet<ExplainBackend>,
    config: ExplainConfig,
    arrays: &InputArrays,
) -> Explanation<ExplainBackend> {
    engine(net, config).explain(net.trace(&batch(arrays)).unwrap()).unwrap()
}

#[test]
fn test_every_input_gets_a_finite_map() {
    let net = network(11);
    let arrays = InputArrays::synthetic(&layout(), 3, Seed::new(5));
    let explanation = explain(&net, ExplainConfig::default(), &arrays);

    let maps = explanation.relevance.to_arrays().unwrap();
    assert_eq!(maps.len(), 5);
    for (name, map) in &maps {
        assert_eq!(
            map.shape(),
            layout().input_dims(*name, 3).as_slice(),
            "{name}"
        );
        assert!(map.iter().all(|v| v.is_finite()), "{name}");
    }
    assert_eq!(explanation.logits.dims(), [3, 1]);

    let totals = explanation.relevance.sample_totals().unwrap();
    assert_eq!(totals.len(), 3);
    assert!(totals.iter().all(|t| t.is_finite()));
    assert!(totals.iter().any(|t| t.abs() > 0.0));
}

#[test]
fn test_empty_batch_is_an_error() {
    let arrays = InputArrays::zeros(&layout(), 0);
    let err = InputBatch::<ExplainBackend>::from_arrays(&arrays, &layout(), &Default::default())
        .unwrap_err();
    assert!(matches!(err, aki::core::CoreError::EmptyBatch));
}

#[test]
fn test_explanations_are_deterministic() {
    let arrays = InputArrays::synthetic(&layout(), 2, Seed::new(9));
    let a = explain(&network(3), ExplainConfig::default(), &arrays)
        .relevance
        .to_arrays()
        .unwrap();
    let b = explain(&network(3), ExplainConfig::default(), &arrays)
        .relevance
        .to_arrays()
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_zero_inputs_have_zero_relevance() {
    let net = network(11);
    let arrays = InputArrays::zeros(&layout(), 2);
    let maps = explain(&net, ExplainConfig::default(), &arrays)
        .relevance
        .to_arrays()
        .unwrap();
    for (name, map) in maps {
        assert!(map.iter().all(|v| *v == 0.0), "{name}: {map:?}");
    }
}

#[test]
fn test_prediction_seeding_scales_each_sample() {
    let net = network(11);
    let n = 3;
    let arrays = InputArrays::synthetic(&layout(), n, Seed::new(21));

    let uniform = explain(&net, ExplainConfig::default(), &arrays);
    let prediction = explain(
        &net,
        ExplainConfig::default().with_output_relevance(OutputRelevance::Prediction),
        &arrays,
    );
    let probs: Vec<f32> = sigmoid(uniform.logits.clone())
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap();

    let uniform: BTreeMap<InputName, Array4<f32>> = uniform.relevance.to_arrays().unwrap();
    let prediction = prediction.relevance.to_arrays().unwrap();
    for (name, map) in &uniform {
        let scaled = &prediction[name];
        for ((index, u), p) in map.indexed_iter().zip(scaled.iter()) {
            let expected = u * probs[index.0] * n as f32;
            assert!(
                (p - expected).abs() <= 1e-6 + 1e-3 * expected.abs(),
                "{name} {index:?}: {p} != {expected}"
            );
        }
    }
}

#[test]
fn test_audit_covers_parametric_layers() {
    let net = network(11);
    let arrays = InputArrays::synthetic(&layout(), 2, Seed::new(5));
    let audit = explain(&net, ExplainConfig::default().with_audit(true), &arrays).audit;

    assert!(!audit.is_empty());
    assert_eq!(audit[0].branch, BranchId::Head);

    // The output layer sees the full seed; its bias-free ε rule may only
    // lose the stabilizer's share.
    let output = &audit[0];
    assert_eq!(output.layer, "head.2");
    assert!((output.before - 1.0).abs() < 1e-5, "{output:?}");
    assert!(output.drift() <= 1e-4 * output.before.abs(), "{output:?}");
    assert!(audit.iter().all(|e| e.before.is_finite() && e.after.is_finite()));
    assert!(audit.iter().any(|e| e.layer.starts_with("drug.")));
    assert!(audit.iter().any(|e| e.layer.starts_with("timeseries-stack.")));
}

#[test]
fn test_normalization_layer_is_rejected_before_explaining() {
    let net = network(11);
    let mut layers = net.layers().clone();
    let device = Default::default();
    layers.push(
        "head.norm",
        LayerGroup::Head,
        Operator::Normalization {
            scale: Tensor::ones([1], &device),
            shift: Tensor::zeros([1], &device),
        },
    );
    let rules = default_rules(&layers);
    let err = LrpEngine::new(layers, &rules, ExplainConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        ExplainError::UnsupportedOperator { ref layer, kind: OperatorKind::Normalization }
            if layer == "head.norm"
    ));
    assert!(err.is_config_error());
}

#[test]
fn test_rule_count_must_match_layers() {
    let net = network(11);
    let mut rules = default_rules(net.layers());
    rules.pop();
    let err = LrpEngine::new(net.layers().clone(), &rules, ExplainConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        ExplainError::LayerCountMismatch { layers, rules } if layers == rules + 1
    ));
}

#[test]
fn test_rule_list_survives_json() {
    let net = network(11);
    let rules = default_rules(net.layers());
    let text = serde_json::to_string(&rules).unwrap();
    let loaded: Vec<RuleDescription> = serde_json::from_str(&text).unwrap();
    let engine = LrpEngine::new(net.layers().clone(), &loaded, ExplainConfig::default()).unwrap();
    assert_eq!(engine.rules().len(), net.layers().len());
}

#[test]
fn test_relevance_table_names_every_cell() {
    let net = network(11);
    let arrays = InputArrays::synthetic(&layout(), 2, Seed::new(5));
    let explanation = explain(&net, ExplainConfig::default(), &arrays);
    let columns = FeatureColumns::placeholder(&layout());

    let table = RelevanceTable::build(
        &explanation.relevance,
        &columns,
        &layout(),
        RelevanceSign::Absolute,
    )
    .unwrap();
    let cells: usize = explanation
        .relevance
        .iter()
        .map(|(_, map)| map.dims()[1..].iter().product::<usize>())
        .sum();
    assert_eq!(table.len(), 2);
    assert_eq!(table.columns.len(), cells);
    assert!(table.rows.iter().flatten().all(|v| *v >= 0.0));

    let signed = RelevanceTable::build(
        &explanation.relevance,
        &columns,
        &layout(),
        RelevanceSign::Signed,
    )
    .unwrap();
    for (a, s) in table.rows.iter().flatten().zip(signed.rows.iter().flatten()) {
        assert_eq!(*a, s.abs());
    }
    let unavailable = RelevanceTable::unavailable(&columns, &layout(), 2).unwrap();
    assert_eq!(unavailable.columns, table.columns);
}

#[test]
fn test_snapshot_transfers_explanations() {
    let trained = network(11);
    let snapshot = ParameterSnapshot::capture(trained.layers()).unwrap();
    let text = serde_json::to_string(&snapshot).unwrap();
    let loaded: ParameterSnapshot = serde_json::from_str(&text).unwrap();

    let mut fresh = network(99);
    loaded.apply(fresh.layers_mut(), &Default::default()).unwrap();

    let arrays = InputArrays::synthetic(&layout(), 2, Seed::new(5));
    let a = explain(&trained, ExplainConfig::default(), &arrays)
        .relevance
        .to_arrays()
        .unwrap();
    let b = explain(&fresh, ExplainConfig::default(), &arrays)
        .relevance
        .to_arrays()
        .unwrap();
    assert_eq!(a, b);
}
