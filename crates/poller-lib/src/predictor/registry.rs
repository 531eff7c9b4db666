//! Model class registry
//!
//! Resolves the `model_kwargs.class` name from a training config to a
//! constructor. Populated at startup from the built-in ONNX architectures
//! and the locally implemented models.

use super::{BaselineForecaster, Forecaster, ModelSpec, OnnxForecaster};
use anyhow::{Context, Result};
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

/// Constructor for a registered model class
pub type ModelFactory = Box<dyn Fn(&ModelSpec) -> Result<Box<dyn Forecaster>> + Send + Sync>;

/// Architectures loaded from ONNX exports of their trained checkpoints
pub const BUILTIN_MODELS: &[&str] = &[
    "TemporalFusionTransformer",
    "DeepAR",
    "NBeats",
    "NHiTS",
    "RecurrentNetwork",
    "DecoderMLP",
];

/// Models implemented in this crate
pub const LOCAL_MODELS: &[&str] = &["Baseline"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown model class: {0}")]
    UnknownModel(String),

    #[error("model class already registered: {0}")]
    AlreadyRegistered(String),
}

/// Registry mapping class names to model factories
pub struct ModelRegistry {
    factories: HashMap<String, ModelFactory>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in and local models
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_builtin();
        registry.register_local();
        registry
    }

    fn register_builtin(&mut self) {
        for name in BUILTIN_MODELS {
            self.factories.insert(
                name.to_string(),
                Box::new(|spec: &ModelSpec| {
                    Ok(Box::new(OnnxForecaster::load(spec)?) as Box<dyn Forecaster>)
                }),
            );
        }
    }

    fn register_local(&mut self) {
        self.factories.insert(
            "Baseline".to_string(),
            Box::new(|spec: &ModelSpec| {
                Ok(Box::new(BaselineForecaster::from_spec(spec)) as Box<dyn Forecaster>)
            }),
        );
    }

    /// Register an additional model class
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: ModelFactory,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered class names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct the model named by `spec.class`
    pub fn load(&self, spec: &ModelSpec) -> Result<Box<dyn Forecaster>> {
        let factory = self
            .factories
            .get(&spec.class)
            .ok_or_else(|| RegistryError::UnknownModel(spec.class.clone()))?;

        let model = factory(spec)
            .with_context(|| format!("Failed to load {} from {}", spec.class, spec.checkpoint.display()))?;

        info!(
            class = %spec.class,
            quantiles = ?model.quantiles(),
            "Model loaded"
        );
        Ok(model)
    }
}
