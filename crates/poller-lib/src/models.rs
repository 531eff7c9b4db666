//! Core data models for the forecast poller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tract_onnx::prelude::tract_ndarray::Array3;

/// Inference output mode requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PredictMode {
    /// One value per configured quantile level
    Quantiles,
    /// A single point forecast per timestep
    Prediction,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModeError {
    #[error("unsupported predict mode: {0:?} (expected \"quantiles\" or \"prediction\")")]
    Unknown(String),
}

impl PredictMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictMode::Quantiles => "quantiles",
            PredictMode::Prediction => "prediction",
        }
    }
}

impl FromStr for PredictMode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quantiles" => Ok(PredictMode::Quantiles),
            "prediction" => Ok(PredictMode::Prediction),
            other => Err(ModeError::Unknown(other.to_string())),
        }
    }
}

impl TryFrom<String> for PredictMode {
    type Error = ModeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PredictMode> for String {
    fn from(mode: PredictMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for PredictMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a dataset snapshot frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRow {
    /// Original time index of the row
    pub index: DateTime<Utc>,
    /// Integer timestep, consecutive within a group
    pub time_idx: i64,
    pub group: String,
    /// One value per target; `None` for rows still in the future
    pub values: Vec<Option<f64>>,
}

impl FrameRow {
    pub fn is_observed(&self) -> bool {
        self.values.iter().any(Option::is_some)
    }
}

/// Prediction-ready dataset for a single poll cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSnapshot {
    pub target_names: Vec<String>,
    pub max_encoder_length: usize,
    pub max_prediction_length: usize,
    pub frame: Vec<FrameRow>,
}

/// Observed history of one group, ready to feed a model
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderWindow {
    pub group: String,
    /// `[encoder_length][targets]`, gaps forward-filled then zero-filled
    pub values: Vec<Vec<f32>>,
    /// Time index of the first step to predict
    pub first_prediction_idx: i64,
}

impl DatasetSnapshot {
    /// Rows partitioned by group, groups ascending, rows ascending by time index
    pub fn groups(&self) -> BTreeMap<&str, Vec<&FrameRow>> {
        let mut groups: BTreeMap<&str, Vec<&FrameRow>> = BTreeMap::new();
        for row in &self.frame {
            groups.entry(row.group.as_str()).or_default().push(row);
        }
        for rows in groups.values_mut() {
            rows.sort_by_key(|r| r.time_idx);
        }
        groups
    }

    /// Encoder windows for every group with at least `max_encoder_length`
    /// observed rows. Groups with less history are left out.
    pub fn encoder_windows(&self) -> Vec<EncoderWindow> {
        let n_targets = self.target_names.len();
        let mut windows = Vec::new();

        for (group, rows) in self.groups() {
            let observed: Vec<&FrameRow> = rows.into_iter().filter(|r| r.is_observed()).collect();
            let encoder_length = self.max_encoder_length.max(1);
            if observed.len() < encoder_length {
                continue;
            }
            let window = &observed[observed.len() - encoder_length..];

            let mut last: Vec<Option<f64>> = vec![None; n_targets];
            let mut values: Vec<Vec<f32>> = Vec::with_capacity(window.len());
            for row in window {
                for (t, slot) in last.iter_mut().enumerate() {
                    if let Some(v) = row.values.get(t).copied().flatten() {
                        *slot = Some(v);
                    }
                }
                values.push(last.iter().map(|v| v.unwrap_or(0.0) as f32).collect());
            }

            // window is non-empty since encoder_length >= 1
            let first_prediction_idx = window[window.len() - 1].time_idx + 1;
            windows.push(EncoderWindow {
                group: group.to_string(),
                values,
                first_prediction_idx,
            });
        }

        windows
    }
}

/// Maps a tensor row position back to its group and first predicted timestep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub group: String,
    pub time_idx: i64,
}

/// Raw model output for one dataset snapshot
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    /// One tensor per target, shaped `[groups, horizon, quantiles-or-1]`
    pub predictions: Vec<Array3<f32>>,
    /// Row `i` describes position `i` of every tensor
    pub index: Vec<IndexEntry>,
}

/// One reshaped prediction row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub index: DateTime<Utc>,
    pub time_idx: i64,
    pub group: String,
    /// Aligned with `PredictionTable::columns`
    pub values: Vec<f64>,
}

/// Tabular predictions ready for the sink
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionTable {
    pub columns: Vec<String>,
    pub rows: Vec<PredictionRow>,
}

impl PredictionTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(group: &str, time_idx: i64, value: Option<f64>) -> FrameRow {
        FrameRow {
            index: Utc.timestamp_opt(time_idx * 60, 0).unwrap(),
            time_idx,
            group: group.to_string(),
            values: vec![value],
        }
    }

    #[test]
    fn test_predict_mode_parse() {
        assert_eq!("quantiles".parse::<PredictMode>().unwrap(), PredictMode::Quantiles);
        assert_eq!("prediction".parse::<PredictMode>().unwrap(), PredictMode::Prediction);
        assert_eq!(
            "bogus".parse::<PredictMode>(),
            Err(ModeError::Unknown("bogus".to_string()))
        );
    }

    #[test]
    fn test_groups_sorted() {
        let snapshot = DatasetSnapshot {
            target_names: vec!["target".to_string()],
            max_encoder_length: 2,
            max_prediction_length: 1,
            frame: vec![row("b", 2, Some(1.0)), row("a", 3, None), row("a", 1, Some(2.0))],
        };

        let groups = snapshot.groups();
        let keys: Vec<&str> = groups.keys().copied().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(groups["a"][0].time_idx, 1);
        assert_eq!(groups["a"][1].time_idx, 3);
    }

    #[test]
    fn test_encoder_windows_skip_short_groups() {
        let snapshot = DatasetSnapshot {
            target_names: vec!["target".to_string()],
            max_encoder_length: 3,
            max_prediction_length: 1,
            frame: vec![
                row("a", 0, Some(1.0)),
                row("a", 1, Some(2.0)),
                row("a", 2, Some(3.0)),
                row("a", 3, None),
                row("short", 0, Some(5.0)),
            ],
        };

        let windows = snapshot.encoder_windows();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].group, "a");
        assert_eq!(windows[0].values, vec![vec![1.0], vec![2.0], vec![3.0]]);
        assert_eq!(windows[0].first_prediction_idx, 3);
    }

    #[test]
    fn test_encoder_windows_forward_fill() {
        let at = |time_idx: i64, values: Vec<Option<f64>>| FrameRow {
            index: Utc.timestamp_opt(time_idx * 60, 0).unwrap(),
            time_idx,
            group: "a".to_string(),
            values,
        };
        let snapshot = DatasetSnapshot {
            target_names: vec!["target-x".to_string(), "target-y".to_string()],
            max_encoder_length: 3,
            max_prediction_length: 1,
            frame: vec![
                at(0, vec![Some(1.0), None]),
                at(1, vec![None, Some(4.0)]),
                at(2, vec![Some(2.0), None]),
            ],
        };

        let windows = snapshot.encoder_windows();
        assert_eq!(
            windows[0].values,
            vec![vec![1.0, 0.0], vec![1.0, 4.0], vec![2.0, 4.0]]
        );
    }
}
