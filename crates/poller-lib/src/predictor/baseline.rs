//! Last-value baseline model
//!
//! Needs no checkpoint: every horizon step and every quantile repeats the
//! last observed value of the target.

use super::{apply_mode, Forecaster, ModelSpec};
use crate::models::{DatasetSnapshot, IndexEntry, InferenceOutput, PredictMode};
use anyhow::Result;
use tract_onnx::prelude::tract_ndarray::Array3;
use tracing::debug;

pub struct BaselineForecaster {
    quantiles: Vec<f64>,
}

impl BaselineForecaster {
    pub fn new(quantiles: Vec<f64>) -> Self {
        Self { quantiles }
    }

    pub fn from_spec(spec: &ModelSpec) -> Self {
        Self::new(spec.quantiles.clone())
    }
}

impl Forecaster for BaselineForecaster {
    fn predict(&self, snapshot: &DatasetSnapshot, mode: PredictMode) -> Result<InferenceOutput> {
        let windows = snapshot.encoder_windows();
        let horizon = snapshot.max_prediction_length;
        let width = self.quantiles.len().max(1);

        let predictions = (0..snapshot.target_names.len())
            .map(|target| {
                let tensor = Array3::from_shape_fn((windows.len(), horizon, width), |(g, _, _)| {
                    windows[g]
                        .values
                        .last()
                        .and_then(|step| step.get(target))
                        .copied()
                        .unwrap_or(0.0)
                });
                apply_mode(tensor, mode)
            })
            .collect();

        let index = windows
            .iter()
            .map(|w| IndexEntry {
                group: w.group.clone(),
                time_idx: w.first_prediction_idx,
            })
            .collect();

        debug!(groups = windows.len(), horizon, "Baseline inference completed");

        Ok(InferenceOutput { predictions, index })
    }

    fn quantiles(&self) -> &[f64] {
        &self.quantiles
    }

    fn name(&self) -> &str {
        "Baseline"
    }
}
