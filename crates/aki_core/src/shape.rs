//! Feature layout of the five model inputs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// The five named inputs produced by the feature-engineering pipeline.
///
/// Relevance is reported per input under the same names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputName {
    /// Drug administration per slot.
    Drug,
    /// Static patient information.
    PatientInfo,
    /// Dynamic laboratory time series with per-slot statistics.
    Timeseries,
    /// Remaining dynamic measurements, one value per slot.
    DynamicOther,
    /// Threshold flags, ratios and gradients derived from the time series.
    Threshold,
}

impl InputName {
    /// All inputs in reporting order.
    pub const ALL: [InputName; 5] = [
        InputName::Drug,
        InputName::PatientInfo,
        InputName::Timeseries,
        InputName::DynamicOther,
        InputName::Threshold,
    ];

    /// Kebab-case name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            InputName::Drug => "drug",
            InputName::PatientInfo => "patient-info",
            InputName::Timeseries => "timeseries",
            InputName::DynamicOther => "dynamic-other",
            InputName::Threshold => "threshold",
        }
    }
}

impl fmt::Display for InputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sizes of the feature axes of every input.
///
/// All inputs share the slot axis (`slots` = days × `slots_per_day`). The
/// time series carries `stat_rows` rows per slot; the threshold input
/// stacks `2 * stat_rows` flag rows, `stat_rows` ratio rows and
/// `stat_rows` gradient rows, in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLayout {
    /// Number of drug features.
    pub drug_features: usize,
    /// Number of static patient-info features.
    pub info_features: usize,
    /// Number of time-series channels (shared with the threshold input).
    pub timeseries_features: usize,
    /// Number of dynamic-other features.
    pub dynamic_other_features: usize,
    /// Total number of slots.
    pub slots: usize,
    /// Slots per day.
    pub slots_per_day: usize,
    /// Statistic rows per slot.
    pub stat_rows: usize,
}

impl Default for FeatureLayout {
    fn default() -> Self {
        Self {
            drug_features: 20,
            info_features: 46,
            timeseries_features: 12,
            dynamic_other_features: 8,
            slots: 6,
            slots_per_day: 3,
            stat_rows: 3,
        }
    }
}

impl FeatureLayout {
    /// Check that every axis is non-empty and slots divide into days.
    pub fn validate(&self) -> Result<()> {
        let axes = [
            ("drug_features", self.drug_features),
            ("info_features", self.info_features),
            ("timeseries_features", self.timeseries_features),
            ("dynamic_other_features", self.dynamic_other_features),
            ("slots", self.slots),
            ("slots_per_day", self.slots_per_day),
            ("stat_rows", self.stat_rows),
        ];
        if let Some((name, _)) = axes.iter().find(|(_, size)| *size == 0) {
            return Err(CoreError::InvalidLayout(format!("{name} must be positive")));
        }
        if self.slots % self.slots_per_day != 0 {
            return Err(CoreError::InvalidLayout(format!(
                "{} slots do not divide into days of {}",
                self.slots, self.slots_per_day
            )));
        }
        Ok(())
    }

    /// Number of days covered by the slot axis.
    pub fn days(&self) -> usize {
        self.slots / self.slots_per_day
    }

    /// Flag rows at the top of the threshold input.
    pub fn flag_rows(&self) -> usize {
        2 * self.stat_rows
    }

    /// Total rows of the threshold input.
    pub fn threshold_rows(&self) -> usize {
        4 * self.stat_rows
    }

    /// Rank-4 view `(N, C, H, W)` the network consumes for `input`.
    pub fn input_dims(&self, input: InputName, batch: usize) -> [usize; 4] {
        match input {
            InputName::Drug => [batch, self.drug_features, 1, self.slots],
            InputName::PatientInfo => [batch, 1, 1, self.info_features],
            InputName::Timeseries => [batch, self.timeseries_features, self.stat_rows, self.slots],
            InputName::DynamicOther => [batch, self.dynamic_other_features, 1, self.slots],
            InputName::Threshold => [
                batch,
                self.timeseries_features,
                self.threshold_rows(),
                self.slots,
            ],
        }
    }

    /// Width of the binary join: drug slots, info features, dynamic-other slots.
    pub fn binary_width(&self) -> usize {
        2 * self.slots + self.info_features
    }

    /// Width of the time-series join: five attention outputs side by side.
    pub fn timeseries_width(&self) -> usize {
        5 * self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_valid() {
        let layout = FeatureLayout::default();
        assert!(layout.validate().is_ok());
        assert_eq!(layout.days(), 2);
        assert_eq!(layout.binary_width(), 58);
        assert_eq!(layout.timeseries_width(), 30);
    }

    #[test]
    fn test_input_dims() {
        let layout = FeatureLayout::default();
        assert_eq!(layout.input_dims(InputName::Drug, 4), [4, 20, 1, 6]);
        assert_eq!(layout.input_dims(InputName::PatientInfo, 4), [4, 1, 1, 46]);
        assert_eq!(layout.input_dims(InputName::Threshold, 4), [4, 12, 12, 6]);
    }

    #[test]
    fn test_invalid_layout() {
        let layout = FeatureLayout {
            slots: 5,
            ..FeatureLayout::default()
        };
        assert!(matches!(layout.validate(), Err(CoreError::InvalidLayout(_))));

        let layout = FeatureLayout {
            stat_rows: 0,
            ..FeatureLayout::default()
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_input_name_serde() {
        let json = serde_json::to_string(&InputName::PatientInfo).unwrap();
        assert_eq!(json, "\"patient-info\"");
        let back: InputName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InputName::PatientInfo);
    }
}
