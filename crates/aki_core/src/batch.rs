//! Input arrays handed over by the feature pipeline and their tensor form.

use burn::prelude::*;
use ndarray::{Array2, Array3, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::seed::Seed;
use crate::shape::{FeatureLayout, InputName};

/// Host-side inputs of one batch, in the shapes the feature pipeline emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputArrays {
    /// `N × drug_features × slots`.
    pub drug: Array3<f32>,
    /// `N × info_features`.
    pub patient_info: Array2<f32>,
    /// `N × timeseries_features × stat_rows × slots`.
    pub timeseries: Array4<f32>,
    /// `N × dynamic_other_features × slots`.
    pub dynamic_other: Array3<f32>,
    /// `N × timeseries_features × 4·stat_rows × slots`.
    pub threshold: Array4<f32>,
}

impl InputArrays {
    /// All-zero inputs for `batch` samples.
    pub fn zeros(layout: &FeatureLayout, batch: usize) -> Self {
        Self {
            drug: Array3::zeros((batch, layout.drug_features, layout.slots)),
            patient_info: Array2::zeros((batch, layout.info_features)),
            timeseries: Array4::zeros((
                batch,
                layout.timeseries_features,
                layout.stat_rows,
                layout.slots,
            )),
            dynamic_other: Array3::zeros((batch, layout.dynamic_other_features, layout.slots)),
            threshold: Array4::zeros((
                batch,
                layout.timeseries_features,
                layout.threshold_rows(),
                layout.slots,
            )),
        }
    }

    /// Reproducible synthetic inputs for demos and tests.
    ///
    /// Continuous inputs are drawn from `[0, 1)`, flag rows are binary.
    pub fn synthetic(layout: &FeatureLayout, batch: usize, seed: Seed) -> Self {
        let mut inputs = Self::zeros(layout, batch);
        let mut rng = seed.stream("inputs");

        inputs.drug.mapv_inplace(|_| if rng.gen_bool(0.3) { 1.0 } else { 0.0 });
        inputs.patient_info.mapv_inplace(|_| rng.gen::<f32>());
        inputs.timeseries.mapv_inplace(|_| rng.gen::<f32>());
        inputs.dynamic_other.mapv_inplace(|_| rng.gen::<f32>());

        let flag_rows = layout.flag_rows();
        for ((_, _, row, _), value) in inputs.threshold.indexed_iter_mut() {
            *value = if row < flag_rows {
                if rng.gen_bool(0.2) {
                    1.0
                } else {
                    0.0
                }
            } else {
                rng.gen::<f32>()
            };
        }
        inputs
    }

    /// Number of samples.
    pub fn batch_size(&self) -> usize {
        self.drug.shape()[0]
    }

    /// Check every array against `layout` and return the batch size.
    ///
    /// A batch must hold at least one sample.
    pub fn validate(&self, layout: &FeatureLayout) -> Result<usize> {
        let batch = self.batch_size();
        if batch == 0 {
            return Err(CoreError::EmptyBatch);
        }
        let checks: [(InputName, &[usize], Vec<usize>); 5] = [
            (
                InputName::Drug,
                self.drug.shape(),
                vec![batch, layout.drug_features, layout.slots],
            ),
            (
                InputName::PatientInfo,
                self.patient_info.shape(),
                vec![batch, layout.info_features],
            ),
            (
                InputName::Timeseries,
                self.timeseries.shape(),
                vec![batch, layout.timeseries_features, layout.stat_rows, layout.slots],
            ),
            (
                InputName::DynamicOther,
                self.dynamic_other.shape(),
                vec![batch, layout.dynamic_other_features, layout.slots],
            ),
            (
                InputName::Threshold,
                self.threshold.shape(),
                vec![
                    batch,
                    layout.timeseries_features,
                    layout.threshold_rows(),
                    layout.slots,
                ],
            ),
        ];

        for (input, got, expected) in checks {
            if got[0] != batch {
                return Err(CoreError::BatchMismatch {
                    input: input.to_string(),
                    expected: batch,
                    got: got[0],
                });
            }
            if got != expected.as_slice() {
                return Err(CoreError::InvalidShape {
                    input: input.to_string(),
                    expected: format!("{expected:?}"),
                    got: format!("{got:?}"),
                });
            }
        }
        Ok(batch)
    }
}

/// The five inputs as rank-4 tensors, in the views the network consumes.
///
/// See [`FeatureLayout::input_dims`] for the view of each input.
#[derive(Debug, Clone)]
pub struct InputBatch<B: Backend> {
    drug: Tensor<B, 4>,
    patient_info: Tensor<B, 4>,
    timeseries: Tensor<B, 4>,
    dynamic_other: Tensor<B, 4>,
    threshold: Tensor<B, 4>,
}

impl<B: Backend> InputBatch<B> {
    /// Validate `arrays` against `layout` and move them onto `device`.
    pub fn from_arrays(
        arrays: &InputArrays,
        layout: &FeatureLayout,
        device: &B::Device,
    ) -> Result<Self> {
        let batch = arrays.validate(layout)?;
        let view = |input: InputName, values: Vec<f32>| {
            tensor_from_vec::<B>(values, layout.input_dims(input, batch), device)
        };

        Ok(Self {
            drug: view(InputName::Drug, arrays.drug.iter().copied().collect()),
            patient_info: view(
                InputName::PatientInfo,
                arrays.patient_info.iter().copied().collect(),
            ),
            timeseries: view(InputName::Timeseries, arrays.timeseries.iter().copied().collect()),
            dynamic_other: view(
                InputName::DynamicOther,
                arrays.dynamic_other.iter().copied().collect(),
            ),
            threshold: view(InputName::Threshold, arrays.threshold.iter().copied().collect()),
        })
    }

    /// Tensor view of `input`.
    pub fn get(&self, input: InputName) -> &Tensor<B, 4> {
        match input {
            InputName::Drug => &self.drug,
            InputName::PatientInfo => &self.patient_info,
            InputName::Timeseries => &self.timeseries,
            InputName::DynamicOther => &self.dynamic_other,
            InputName::Threshold => &self.threshold,
        }
    }

    /// Number of samples.
    pub fn batch_size(&self) -> usize {
        self.drug.dims()[0]
    }

    /// Device the batch lives on.
    pub fn device(&self) -> B::Device {
        self.drug.device()
    }
}

/// Build a rank-4 tensor from row-major values.
pub fn tensor_from_vec<B: Backend>(
    values: Vec<f32>,
    dims: [usize; 4],
    device: &B::Device,
) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(values, dims), device)
}

/// Copy a rank-4 tensor back to the host.
pub fn tensor_to_array<B: Backend>(tensor: Tensor<B, 4>) -> Result<Array4<f32>> {
    let [n, c, h, w] = tensor.dims();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| CoreError::TensorData(format!("{e:?}")))?;
    Array4::from_shape_vec((n, c, h, w), values).map_err(|e| CoreError::TensorData(e.to_string()))
}
