//! Column metadata naming every scalar of the five relevance maps.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::shape::{FeatureLayout, InputName};

/// Feature names per input axis.
///
/// Slot-based inputs are expanded to one column per feature and slot,
/// named `d{day}_{slot}_{feature}`; rows of the time series and threshold
/// inputs add a suffix. Column order always follows the row-major layout
/// of a sample's relevance map `(C, H, W)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumns {
    /// Drug names.
    pub drug: Vec<String>,
    /// Static patient-info names.
    pub info: Vec<String>,
    /// Time-series channel names.
    pub timeseries: Vec<String>,
    /// Names of the statistic rows of the time series.
    pub timeseries_stats: Vec<String>,
    /// Dynamic-other names.
    pub dynamic_other: Vec<String>,
    /// Names of the flag rows at the top of the threshold input.
    pub flag_rows: Vec<String>,
}

impl FeatureColumns {
    /// Generic names sized for `layout`.
    pub fn placeholder(layout: &FeatureLayout) -> Self {
        let numbered = |prefix: &str, count: usize| -> Vec<String> {
            (0..count).map(|i| format!("{prefix}{i}")).collect()
        };
        let timeseries_stats = if layout.stat_rows == 3 {
            vec!["min".to_string(), "avg".to_string(), "max".to_string()]
        } else {
            numbered("stat", layout.stat_rows)
        };
        let flag_rows = ["low", "high"]
            .iter()
            .flat_map(|side| timeseries_stats.iter().map(move |s| format!("{side}_{s}")))
            .collect();

        Self {
            drug: numbered("drug", layout.drug_features),
            info: numbered("info", layout.info_features),
            timeseries: numbered("ts", layout.timeseries_features),
            timeseries_stats,
            dynamic_other: numbered("dyn", layout.dynamic_other_features),
            flag_rows,
        }
    }

    /// Load column metadata from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Check every name list against `layout`.
    pub fn validate(&self, layout: &FeatureLayout) -> Result<()> {
        let checks = [
            ("drug", self.drug.len(), layout.drug_features),
            ("patient-info", self.info.len(), layout.info_features),
            ("timeseries", self.timeseries.len(), layout.timeseries_features),
            ("timeseries-stats", self.timeseries_stats.len(), layout.stat_rows),
            ("dynamic-other", self.dynamic_other.len(), layout.dynamic_other_features),
            ("flag-rows", self.flag_rows.len(), layout.flag_rows()),
        ];
        for (input, got, expected) in checks {
            if got != expected {
                return Err(CoreError::ColumnCount {
                    input: input.to_string(),
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }

    /// Column names of `input`, one per scalar of a sample's map.
    pub fn columns_for(&self, input: InputName, layout: &FeatureLayout) -> Vec<String> {
        match input {
            InputName::Drug => daily_columns(&self.drug, layout, &[]),
            InputName::PatientInfo => self.info.clone(),
            InputName::DynamicOther => daily_columns(&self.dynamic_other, layout, &[]),
            InputName::Timeseries => daily_columns(&self.timeseries, layout, &self.timeseries_stats),
            InputName::Threshold => {
                let rows: Vec<String> = self
                    .flag_rows
                    .iter()
                    .cloned()
                    .chain(self.timeseries_stats.iter().map(|s| format!("{s}_ratio")))
                    .chain(self.timeseries_stats.iter().map(|s| format!("{s}_gradient")))
                    .collect();
                daily_columns(&self.timeseries, layout, &rows)
            }
        }
    }
}

/// `d{day}_{slot}_` prefix of slot `index`, both counted from one.
pub fn slot_prefix(index: usize, slots_per_day: usize) -> String {
    format!(
        "d{}_{}_",
        index / slots_per_day + 1,
        index % slots_per_day + 1
    )
}

fn daily_columns(features: &[String], layout: &FeatureLayout, rows: &[String]) -> Vec<String> {
    let mut names = Vec::with_capacity(features.len() * rows.len().max(1) * layout.slots);
    for feature in features {
        if rows.is_empty() {
            for w in 0..layout.slots {
                names.push(format!("{}{feature}", slot_prefix(w, layout.slots_per_day)));
            }
            continue;
        }
        for row in rows {
            for w in 0..layout.slots {
                names.push(format!(
                    "{}{feature}_{row}",
                    slot_prefix(w, layout.slots_per_day)
                ));
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FeatureLayout {
        FeatureLayout {
            drug_features: 2,
            info_features: 3,
            timeseries_features: 1,
            dynamic_other_features: 1,
            slots: 6,
            slots_per_day: 3,
            stat_rows: 3,
        }
    }

    #[test]
    fn test_slot_prefix() {
        assert_eq!(slot_prefix(0, 3), "d1_1_");
        assert_eq!(slot_prefix(2, 3), "d1_3_");
        assert_eq!(slot_prefix(4, 3), "d2_2_");
    }

    #[test]
    fn test_drug_columns_are_feature_major() {
        let layout = layout();
        let mut columns = FeatureColumns::placeholder(&layout);
        columns.drug = vec!["aspirin".into(), "heparin".into()];
        let names = columns.columns_for(InputName::Drug, &layout);
        assert_eq!(names.len(), 12);
        assert_eq!(names[0], "d1_1_aspirin");
        assert_eq!(names[5], "d2_3_aspirin");
        assert_eq!(names[6], "d1_1_heparin");
    }

    #[test]
    fn test_threshold_columns_cover_every_row() {
        let layout = layout();
        let mut columns = FeatureColumns::placeholder(&layout);
        columns.timeseries = vec!["creatinine".into()];
        let names = columns.columns_for(InputName::Threshold, &layout);
        assert_eq!(names.len(), layout.threshold_rows() * layout.slots);
        assert_eq!(names[0], "d1_1_creatinine_low_min");
        assert_eq!(names[6 * 6], "d1_1_creatinine_min_ratio");
        assert_eq!(names[9 * 6 + 1], "d1_2_creatinine_min_gradient");
    }

    #[test]
    fn test_info_columns_are_bare() {
        let layout = layout();
        let columns = FeatureColumns::placeholder(&layout);
        assert_eq!(
            columns.columns_for(InputName::PatientInfo, &layout),
            vec!["info0", "info1", "info2"]
        );
    }

    #[test]
    fn test_validate_counts() {
        let layout = layout();
        let mut columns = FeatureColumns::placeholder(&layout);
        assert!(columns.validate(&layout).is_ok());
        columns.flag_rows.pop();
        assert!(matches!(
            columns.validate(&layout),
            Err(CoreError::ColumnCount { expected: 6, got: 5, .. })
        ));
    }
}
