//! Prediction reshaping
//!
//! Turns per-target `[groups, horizon, quantiles]` tensors into one table row
//! per (group, future timestep), keyed by the original time index. Column
//! names are derived from target names by swapping the leading token for a
//! prediction prefix, so `target-region1` becomes `pred-region1` (and
//! `pred-region1-0.5` etc. in quantiles mode).

use crate::models::{DatasetSnapshot, InferenceOutput, PredictMode, PredictionRow, PredictionTable};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReshapeError {
    #[error("group {group:?} appears {count} times in the inference index")]
    AmbiguousGroup { group: String, count: usize },

    #[error("index position {position} for group {group:?} is outside the prediction tensor of {groups} groups")]
    PositionOutOfRange {
        group: String,
        position: usize,
        groups: usize,
    },

    #[error("target {target:?}: model predicted {predicted} steps for group {group:?} but {rows} future rows are available")]
    HorizonMismatch {
        target: String,
        group: String,
        predicted: usize,
        rows: usize,
    },

    #[error("target {target:?}: tensor has {actual} values per step, expected {expected}")]
    QuantileMismatch {
        target: String,
        expected: usize,
        actual: usize,
    },

    #[error("model returned {predictions} prediction tensors for {targets} targets")]
    TargetCountMismatch { predictions: usize, targets: usize },
}

/// Replace the first `-`-delimited token of a target name with `prefix`
pub fn prediction_column_name(target: &str, prefix: &str) -> String {
    let mut tokens = target.splitn(2, '-');
    tokens.next();
    match tokens.next() {
        Some(rest) => format!("{}-{}", prefix, rest),
        None => prefix.to_string(),
    }
}

/// Render a quantile level the way it appears in column names (`0.1`, `1.0`)
pub fn format_quantile(q: f64) -> String {
    if q.fract() == 0.0 {
        format!("{:.1}", q)
    } else {
        q.to_string()
    }
}

/// Converts raw model output into prediction rows
#[derive(Debug, Clone)]
pub struct PredictionReshaper {
    mode: PredictMode,
    quantiles: Vec<f64>,
    prefix: String,
}

impl PredictionReshaper {
    pub fn new(mode: PredictMode, quantiles: Vec<f64>, prefix: impl Into<String>) -> Self {
        Self {
            mode,
            quantiles,
            prefix: prefix.into(),
        }
    }

    /// Values per timestep each tensor must carry
    fn width(&self) -> usize {
        match self.mode {
            PredictMode::Quantiles => self.quantiles.len(),
            PredictMode::Prediction => 1,
        }
    }

    /// Output column names for one target, in tensor order
    pub fn target_columns(&self, target: &str) -> Vec<String> {
        let base = prediction_column_name(target, &self.prefix);
        match self.mode {
            PredictMode::Quantiles => self
                .quantiles
                .iter()
                .map(|q| format!("{}-{}", base, format_quantile(*q)))
                .collect(),
            PredictMode::Prediction => vec![base],
        }
    }

    /// Column layout for the whole table as `(name, target, slot)`.
    /// A name derived twice keeps its first occurrence.
    fn layout(&self, targets: &[String]) -> Vec<(String, usize, usize)> {
        let mut seen = HashSet::new();
        let mut layout = Vec::new();
        for (target_idx, target) in targets.iter().enumerate() {
            for (slot, name) in self.target_columns(target).into_iter().enumerate() {
                if seen.insert(name.clone()) {
                    layout.push((name, target_idx, slot));
                }
            }
        }
        layout
    }

    /// Build the prediction table.
    ///
    /// Every group in the snapshot is matched against the inference index.
    /// Groups without an index entry contribute no rows; groups with more
    /// than one entry are an error. Nothing is returned unless every group
    /// reshapes cleanly.
    pub fn reshape(
        &self,
        snapshot: &DatasetSnapshot,
        output: &InferenceOutput,
    ) -> Result<PredictionTable, ReshapeError> {
        let targets = &snapshot.target_names;
        if output.predictions.len() != targets.len() {
            return Err(ReshapeError::TargetCountMismatch {
                predictions: output.predictions.len(),
                targets: targets.len(),
            });
        }

        let width = self.width();
        for (target, tensor) in targets.iter().zip(&output.predictions) {
            let actual = tensor.shape()[2];
            if actual != width {
                return Err(ReshapeError::QuantileMismatch {
                    target: target.clone(),
                    expected: width,
                    actual,
                });
            }
        }

        let mut positions: HashMap<&str, (usize, i64)> = HashMap::new();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (position, entry) in output.index.iter().enumerate() {
            *counts.entry(entry.group.as_str()).or_default() += 1;
            positions
                .entry(entry.group.as_str())
                .or_insert((position, entry.time_idx));
        }
        if let Some((group, count)) = counts.into_iter().find(|(_, count)| *count > 1) {
            return Err(ReshapeError::AmbiguousGroup {
                group: group.to_string(),
                count,
            });
        }

        let layout = self.layout(targets);
        let mut rows = Vec::new();

        for (group, group_rows) in snapshot.groups() {
            let Some(&(position, first_idx)) = positions.get(group) else {
                warn!(group = %group, "No inference index entry for group, skipping");
                continue;
            };

            let future: Vec<_> = group_rows
                .into_iter()
                .filter(|row| row.time_idx >= first_idx)
                .collect();

            for (target, tensor) in targets.iter().zip(&output.predictions) {
                let groups = tensor.shape()[0];
                if position >= groups {
                    return Err(ReshapeError::PositionOutOfRange {
                        group: group.to_string(),
                        position,
                        groups,
                    });
                }
                let predicted = tensor.shape()[1];
                if predicted != future.len() {
                    return Err(ReshapeError::HorizonMismatch {
                        target: target.clone(),
                        group: group.to_string(),
                        predicted,
                        rows: future.len(),
                    });
                }
            }

            for (step, row) in future.into_iter().enumerate() {
                let values = layout
                    .iter()
                    .map(|(_, target_idx, slot)| {
                        output.predictions[*target_idx][[position, step, *slot]] as f64
                    })
                    .collect();
                rows.push(PredictionRow {
                    index: row.index,
                    time_idx: row.time_idx,
                    group: group.to_string(),
                    values,
                });
            }
        }

        debug!(rows = rows.len(), columns = layout.len(), "Reshaped predictions");

        Ok(PredictionTable {
            columns: layout.into_iter().map(|(name, _, _)| name).collect(),
            rows,
        })
    }
}
