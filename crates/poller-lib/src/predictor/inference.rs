//! ONNX inference using tract
//!
//! Runs forecasting models exported to ONNX. The graph takes the encoder
//! history `[groups, encoder_length, targets]` as f32 and returns one
//! `[groups, horizon, quantiles]` tensor per target.

use super::{apply_mode, Forecaster, ModelSpec};
use crate::models::{DatasetSnapshot, IndexEntry, InferenceOutput, PredictMode};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tract_onnx::prelude::*;
use tracing::{debug, warn};

/// Inference latency above which a warning is logged
const SLOW_INFERENCE: Duration = Duration::from_secs(5);

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// ONNX-based forecaster using tract
pub struct OnnxForecaster {
    name: String,
    model: InferenceModel,
    /// Optimized plans keyed by input shape; the group count varies per cycle
    plans: Mutex<HashMap<[usize; 3], Arc<TractModel>>>,
    quantiles: Vec<f64>,
    inference_count: AtomicU64,
    slow_inference_count: AtomicU64,
}

impl OnnxForecaster {
    /// Load a checkpoint from disk
    pub fn load(spec: &ModelSpec) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_path(&spec.checkpoint)
            .with_context(|| format!("Failed to parse ONNX model {}", spec.checkpoint.display()))?;

        debug!(
            class = %spec.class,
            checkpoint = %spec.checkpoint.display(),
            "Loaded ONNX checkpoint"
        );

        Ok(Self {
            name: spec.class.clone(),
            model,
            plans: Mutex::new(HashMap::new()),
            quantiles: spec.quantiles.clone(),
            inference_count: AtomicU64::new(0),
            slow_inference_count: AtomicU64::new(0),
        })
    }

    /// Optimized plan for a concrete input shape, built on first use
    fn plan_for(&self, shape: [usize; 3]) -> Result<Arc<TractModel>> {
        let mut plans = self
            .plans
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;

        if let Some(plan) = plans.get(&shape) {
            return Ok(plan.clone());
        }

        let plan = self
            .model
            .clone()
            .with_input_fact(0, f32::fact(shape).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;
        let plan = Arc::new(plan);
        plans.insert(shape, plan.clone());
        Ok(plan)
    }

    pub fn stats(&self) -> InferenceStats {
        InferenceStats {
            total_inferences: self.inference_count.load(Ordering::Relaxed),
            slow_inferences: self.slow_inference_count.load(Ordering::Relaxed),
        }
    }
}

impl Forecaster for OnnxForecaster {
    fn predict(&self, snapshot: &DatasetSnapshot, mode: PredictMode) -> Result<InferenceOutput> {
        let start = Instant::now();
        let windows = snapshot.encoder_windows();
        let n_targets = snapshot.target_names.len();
        let horizon = snapshot.max_prediction_length;

        let index: Vec<IndexEntry> = windows
            .iter()
            .map(|w| IndexEntry {
                group: w.group.clone(),
                time_idx: w.first_prediction_idx,
            })
            .collect();

        if windows.is_empty() {
            let width = match mode {
                PredictMode::Quantiles => self.quantiles.len(),
                PredictMode::Prediction => 1,
            };
            let predictions = (0..n_targets)
                .map(|_| tract_ndarray::Array3::zeros((0, horizon, width)))
                .collect();
            return Ok(InferenceOutput { predictions, index });
        }

        let shape = [windows.len(), snapshot.max_encoder_length, n_targets];
        let data: Vec<f32> = windows
            .iter()
            .flat_map(|w| w.values.iter().flatten().copied())
            .collect();
        let input: Tensor = tract_ndarray::Array3::from_shape_vec((shape[0], shape[1], shape[2]), data)
            .context("Encoder window has an unexpected shape")?
            .into();

        let plan = self.plan_for(shape)?;
        let outputs = plan.run(tvec!(input.into()))?;

        if outputs.len() < n_targets {
            anyhow::bail!(
                "Model returned {} outputs, expected one per target ({})",
                outputs.len(),
                n_targets
            );
        }

        let mut predictions = Vec::with_capacity(n_targets);
        for (target, output) in snapshot.target_names.iter().zip(outputs.iter()) {
            let tensor = output
                .to_array_view::<f32>()
                .with_context(|| format!("Output for target {} is not f32", target))?
                .into_dimensionality::<tract_ndarray::Ix3>()
                .with_context(|| format!("Output for target {} is not 3-dimensional", target))?
                .to_owned();
            predictions.push(apply_mode(tensor, mode));
        }

        let elapsed = start.elapsed();
        self.inference_count.fetch_add(1, Ordering::Relaxed);
        if elapsed > SLOW_INFERENCE {
            self.slow_inference_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                elapsed_ms = elapsed.as_millis(),
                groups = windows.len(),
                "Inference exceeded {}s",
                SLOW_INFERENCE.as_secs()
            );
        } else {
            debug!(elapsed_us = elapsed.as_micros(), groups = windows.len(), "Inference completed");
        }

        Ok(InferenceOutput { predictions, index })
    }

    fn quantiles(&self) -> &[f64] {
        &self.quantiles
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Inference statistics
#[derive(Debug, Clone)]
pub struct InferenceStats {
    pub total_inferences: u64,
    pub slow_inferences: u64,
}
