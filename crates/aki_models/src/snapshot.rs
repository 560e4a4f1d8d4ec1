//! Trained-parameter snapshots.
//!
//! A snapshot lists the parameters of every parametric layer by name, as
//! flat row-major vectors with their shapes. It is stored as JSON.
//!
//! # Example
//!
//! ```rust,ignore
//! use aki_models::{AkiNetConfig, ParameterSnapshot};
//!
//! let mut net = AkiNetConfig::default().init::<NdArray>(&device)?;
//! let snapshot = ParameterSnapshot::load_json("weights.json")?;
//! snapshot.apply(net.layers_mut(), &device)?;
//! ```

use std::path::Path;

use aki_core::CoreError;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ModelError, Result};
use crate::layers::LayerTable;
use crate::operator::Operator;

/// Parameters of one layer.
///
/// For normalization layers `weight` holds the scale and `bias` the shift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParameters {
    /// Layer name.
    pub name: String,
    /// Shape of `weight`.
    pub weight_shape: Vec<usize>,
    /// Row-major weight values.
    pub weight: Vec<f32>,
    /// Bias values, if the layer has a bias.
    pub bias: Option<Vec<f32>>,
}

/// Parameters of every parametric layer of a network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    /// Layers in recording order.
    pub layers: Vec<LayerParameters>,
}

fn to_vec<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ModelError::Core(CoreError::TensorData(format!("{e:?}"))))
}

fn mismatch(layer: &str, reason: impl Into<String>) -> ModelError {
    ModelError::SnapshotMismatch {
        layer: layer.to_string(),
        reason: reason.into(),
    }
}

fn replace<B: Backend, const D: usize>(
    layer: &str,
    what: &str,
    current: &Tensor<B, D>,
    shape: &[usize],
    values: &[f32],
    device: &B::Device,
) -> Result<Tensor<B, D>> {
    let dims = current.dims();
    if shape != dims.as_slice() {
        return Err(mismatch(layer, format!("{what} shape {shape:?}, expected {dims:?}")));
    }
    if values.len() != dims.iter().product::<usize>() {
        return Err(mismatch(
            layer,
            format!("{what} has {} values for shape {dims:?}", values.len()),
        ));
    }
    Ok(Tensor::<B, 1>::from_floats(values, device).reshape(dims))
}

fn replace_bias<B: Backend>(
    layer: &str,
    current: &Option<Tensor<B, 1>>,
    values: &Option<Vec<f32>>,
    device: &B::Device,
) -> Result<Option<Tensor<B, 1>>> {
    match (current, values) {
        (Some(current), Some(values)) => {
            replace(layer, "bias", current, &[values.len()], values, device).map(Some)
        }
        (None, None) => Ok(None),
        (Some(_), None) => Err(mismatch(layer, "missing bias")),
        (None, Some(_)) => Err(mismatch(layer, "unexpected bias")),
    }
}

impl ParameterSnapshot {
    /// Capture the parameters of every parametric layer in `table`.
    pub fn capture<B: Backend>(table: &LayerTable<B>) -> Result<Self> {
        let mut layers = Vec::new();
        for (_, layer) in table.iter() {
            let entry = match &layer.operator {
                Operator::Linear { weight, bias } => LayerParameters {
                    name: layer.name.clone(),
                    weight_shape: weight.dims().to_vec(),
                    weight: to_vec(weight)?,
                    bias: bias.as_ref().map(to_vec).transpose()?,
                },
                Operator::Conv { weight, bias, .. } => LayerParameters {
                    name: layer.name.clone(),
                    weight_shape: weight.dims().to_vec(),
                    weight: to_vec(weight)?,
                    bias: bias.as_ref().map(to_vec).transpose()?,
                },
                Operator::Normalization { scale, shift } => LayerParameters {
                    name: layer.name.clone(),
                    weight_shape: scale.dims().to_vec(),
                    weight: to_vec(scale)?,
                    bias: Some(to_vec(shift)?),
                },
                _ => continue,
            };
            layers.push(entry);
        }
        Ok(Self { layers })
    }

    /// Overwrite the parameters in `table`.
    ///
    /// Every parametric layer must be covered, and shapes must match.
    pub fn apply<B: Backend>(&self, table: &mut LayerTable<B>, device: &B::Device) -> Result<()> {
        for entry in &self.layers {
            let id = table
                .find(&entry.name)
                .ok_or_else(|| mismatch(&entry.name, "no such layer"))?;
            let layer = table
                .get_mut(id)
                .ok_or_else(|| mismatch(&entry.name, "no such layer"))?;
            let name = entry.name.as_str();
            match &mut layer.operator {
                Operator::Linear { weight, bias } => {
                    *weight = replace(name, "weight", weight, &entry.weight_shape, &entry.weight, device)?;
                    *bias = replace_bias(name, bias, &entry.bias, device)?;
                }
                Operator::Conv { weight, bias, .. } => {
                    *weight = replace(name, "weight", weight, &entry.weight_shape, &entry.weight, device)?;
                    *bias = replace_bias(name, bias, &entry.bias, device)?;
                }
                Operator::Normalization { scale, shift } => {
                    *scale = replace(name, "scale", scale, &entry.weight_shape, &entry.weight, device)?;
                    let values = entry
                        .bias
                        .as_ref()
                        .ok_or_else(|| mismatch(name, "missing shift"))?;
                    *shift = replace(name, "shift", shift, &[values.len()], values, device)?;
                }
                _ => return Err(mismatch(name, "layer has no parameters")),
            }
        }

        if let Some((_, missing)) = table
            .iter()
            .filter(|(_, l)| l.operator.parameter_count() > 0)
            .find(|(_, l)| !self.layers.iter().any(|e| e.name == l.name))
        {
            return Err(mismatch(&missing.name, "not covered by the snapshot"));
        }
        info!(layers = self.layers.len(), "applied parameter snapshot");
        Ok(())
    }

    /// Load a snapshot from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write the snapshot as JSON.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::LayerGroup;
    use crate::operator::ActivationKind;
    use crate::trace::BranchId;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn table(fill: f32) -> LayerTable<TestBackend> {
        let device = Default::default();
        let mut table = LayerTable::new();
        table.push(
            "head.0",
            LayerGroup::Head,
            Operator::Linear {
                weight: Tensor::full([2, 3], fill, &device),
                bias: Some(Tensor::full([3], fill, &device)),
            },
        );
        table.push(
            "head.1",
            LayerGroup::Head,
            Operator::Activation(ActivationKind::Relu),
        );
        table.push(
            "drug.shortcut",
            LayerGroup::Encoder(BranchId::Drug),
            Operator::Conv {
                weight: Tensor::full([4, 2, 1, 1], fill, &device),
                bias: None,
                stride: [1, 1],
                pad: [0, 0],
            },
        );
        table
    }

    #[test]
    fn test_capture_and_apply() {
        let source = table(0.5);
        let snapshot = ParameterSnapshot::capture(&source).unwrap();
        assert_eq!(snapshot.layers.len(), 2);
        assert_eq!(snapshot.layers[1].weight_shape, vec![4, 2, 1, 1]);
        assert!(snapshot.layers[1].bias.is_none());

        let mut target = table(0.0);
        snapshot.apply(&mut target, &Default::default()).unwrap();
        assert_eq!(ParameterSnapshot::capture(&target).unwrap(), snapshot);
    }

    #[test]
    fn test_shape_mismatch_names_the_layer() {
        let mut snapshot = ParameterSnapshot::capture(&table(1.0)).unwrap();
        snapshot.layers[0].weight_shape = vec![3, 2];
        let err = snapshot
            .apply(&mut table(0.0), &Default::default())
            .unwrap_err();
        assert!(matches!(err, ModelError::SnapshotMismatch { ref layer, .. } if layer == "head.0"));
    }

    #[test]
    fn test_uncovered_layer_is_rejected() {
        let mut snapshot = ParameterSnapshot::capture(&table(1.0)).unwrap();
        snapshot.layers.pop();
        assert!(snapshot.apply(&mut table(0.0), &Default::default()).is_err());
    }
}
