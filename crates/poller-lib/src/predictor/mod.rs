//! Forecast model inference and output reshaping

mod baseline;
mod inference;
mod registry;
mod reshape;

pub use baseline::BaselineForecaster;
pub use inference::{InferenceStats, OnnxForecaster};
pub use registry::{ModelFactory, ModelRegistry, RegistryError, BUILTIN_MODELS, LOCAL_MODELS};
pub use reshape::{
    format_quantile, prediction_column_name, PredictionReshaper, ReshapeError,
};

use crate::models::{DatasetSnapshot, InferenceOutput, PredictMode};
use anyhow::Result;
use std::path::PathBuf;
use tract_onnx::prelude::tract_ndarray::{Array3, Axis};

/// Quantile levels used when the training config does not override them
pub const DEFAULT_QUANTILES: [f64; 7] = [0.02, 0.1, 0.25, 0.5, 0.75, 0.9, 0.98];

/// Trait for forecasting model implementations
pub trait Forecaster: Send + Sync {
    /// Run inference over every group in the snapshot
    fn predict(&self, snapshot: &DatasetSnapshot, mode: PredictMode) -> Result<InferenceOutput>;

    /// Quantile levels enumerated by the last tensor dimension in quantiles mode
    fn quantiles(&self) -> &[f64];

    /// Registered model class name
    fn name(&self) -> &str;
}

/// Everything a model factory needs to build a forecaster
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub class: String,
    pub checkpoint: PathBuf,
    pub quantiles: Vec<f64>,
}

impl ModelSpec {
    pub fn new(class: impl Into<String>, checkpoint: impl Into<PathBuf>) -> Self {
        Self {
            class: class.into(),
            checkpoint: checkpoint.into(),
            quantiles: DEFAULT_QUANTILES.to_vec(),
        }
    }

    pub fn with_quantiles(mut self, quantiles: Vec<f64>) -> Self {
        self.quantiles = quantiles;
        self
    }
}

/// Reduce a `[groups, horizon, quantiles]` tensor to what `mode` asks for.
///
/// Point predictions take the median quantile (index `len / 2`).
pub(crate) fn apply_mode(tensor: Array3<f32>, mode: PredictMode) -> Array3<f32> {
    match mode {
        PredictMode::Quantiles => tensor,
        PredictMode::Prediction => {
            let width = tensor.len_of(Axis(2));
            if width == 0 {
                return tensor;
            }
            tensor
                .index_axis(Axis(2), width / 2)
                .insert_axis(Axis(2))
                .to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mode_median() {
        let tensor = Array3::from_shape_fn((2, 3, 5), |(g, h, q)| (g * 100 + h * 10 + q) as f32);

        let point = apply_mode(tensor.clone(), PredictMode::Prediction);
        assert_eq!(point.shape(), &[2, 3, 1]);
        assert_eq!(point[[1, 2, 0]], 122.0);

        let quantiles = apply_mode(tensor, PredictMode::Quantiles);
        assert_eq!(quantiles.shape(), &[2, 3, 5]);
    }

    #[test]
    fn test_model_spec_defaults() {
        let spec = ModelSpec::new("Baseline", "unused.onnx");
        assert_eq!(spec.quantiles, DEFAULT_QUANTILES.to_vec());

        let spec = spec.with_quantiles(vec![0.1, 0.5, 0.9]);
        assert_eq!(spec.quantiles.len(), 3);
    }
}
