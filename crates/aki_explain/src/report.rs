//! Column-named relevance table.
//!
//! One row per sample and one column per scalar of the five input maps,
//! in the order drug, patient-info, dynamic-other, timeseries, threshold.
//! Consumers read `NaN` as "no signal for this cell".

use std::path::Path;

use aki_core::{CoreError, FeatureColumns, FeatureLayout, InputName};
use burn::prelude::*;
use ndarray::Axis;
use serde::{Deserialize, Serialize};

use crate::engine::InputRelevance;
use crate::error::{ExplainError, Result};

/// Inputs in table order.
pub const TABLE_ORDER: [InputName; 5] = [
    InputName::Drug,
    InputName::PatientInfo,
    InputName::DynamicOther,
    InputName::Timeseries,
    InputName::Threshold,
];

/// How relevance values are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelevanceSign {
    /// Magnitudes only.
    #[default]
    Absolute,
    /// Signed values.
    Signed,
}

/// Relevance of every named input cell, one row per sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceTable {
    /// Column names.
    pub columns: Vec<String>,
    /// One row per sample, aligned with `columns`.
    pub rows: Vec<Vec<f32>>,
}

fn table_columns(columns: &FeatureColumns, layout: &FeatureLayout) -> Result<Vec<(InputName, Vec<String>)>> {
    columns.validate(layout)?;
    Ok(TABLE_ORDER
        .iter()
        .map(|input| (*input, columns.columns_for(*input, layout)))
        .collect())
}

impl RelevanceTable {
    /// Build the table from the engine's input maps.
    pub fn build<B: Backend>(
        relevance: &InputRelevance<B>,
        columns: &FeatureColumns,
        layout: &FeatureLayout,
        sign: RelevanceSign,
    ) -> Result<Self> {
        let named = table_columns(columns, layout)?;
        let mut rows: Vec<Vec<f32>> = Vec::new();
        let mut names = Vec::new();
        for (input, input_columns) in named {
            let map = relevance.get(input).ok_or_else(|| ExplainError::ExplanationFailed {
                branch: input.to_string(),
                operator: "report".into(),
                reason: "no relevance map".into(),
            })?;
            let array = aki_core::tensor_to_array(map.clone())?;
            let per_sample = array.len() / array.shape()[0].max(1);
            if per_sample != input_columns.len() {
                return Err(CoreError::ColumnCount {
                    input: input.to_string(),
                    expected: per_sample,
                    got: input_columns.len(),
                }
                .into());
            }
            if rows.is_empty() {
                rows = vec![Vec::new(); array.shape()[0]];
            }
            for (row, sample) in rows.iter_mut().zip(array.axis_iter(Axis(0))) {
                row.extend(sample.iter().map(|v| match sign {
                    RelevanceSign::Absolute => v.abs(),
                    RelevanceSign::Signed => *v,
                }));
            }
            names.extend(input_columns);
        }
        Ok(Self {
            columns: names,
            rows,
        })
    }

    /// An all-`NaN` table for `batch` samples, used when no explanation is
    /// available.
    pub fn unavailable(columns: &FeatureColumns, layout: &FeatureLayout, batch: usize) -> Result<Self> {
        let names: Vec<String> = table_columns(columns, layout)?
            .into_iter()
            .flat_map(|(_, names)| names)
            .collect();
        Ok(Self {
            rows: vec![vec![f32::NAN; names.len()]; batch],
            columns: names,
        })
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` for sample `row`.
    pub fn get(&self, row: usize, column: &str) -> Option<f32> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index).copied()
    }

    /// Serialize to JSON. `NaN` cells are written as `null`.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Write the table as JSON.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
