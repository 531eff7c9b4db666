//! Configuration loading
//!
//! Two YAML documents drive the poller:
//! - the runtime config (`predict.yaml`) naming the model, source, sink and cadence
//! - the training config saved next to the model, from which inference-time
//!   dataset parameters are derived

mod resample;
mod translate;

pub use resample::parse_resample_rule;
pub use translate::{InferenceParams, SourceConfig};

use crate::models::PredictMode;
use crate::sink::WriteOptions;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default prefix replacing the first token of target names
pub const DEFAULT_PREDICTION_PREFIX: &str = "pred";

/// Default runtime config path when none is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "predict.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: ::config::ConfigError,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("missing required key `{0}`")]
    MissingKey(String),

    #[error("key `{key}` must be {expected}")]
    InvalidType { key: String, expected: &'static str },

    #[error("invalid resample rule: {0:?}")]
    InvalidResampleRule(String),

    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Connection parameters for the SQL sink
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// SQLAlchemy-style URL, e.g. `sqlite:///var/lib/poller/predictions.db`
    pub url: String,
}

/// Options passed to the model's inference routine
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PredictOptions {
    pub mode: PredictMode,
}

/// Runtime configuration (`predict.yaml`)
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Saved model checkpoint
    pub model_path: PathBuf,

    /// Training config the checkpoint was produced with
    pub train_kwargs: PathBuf,

    pub engine_kwargs: EngineConfig,

    pub write_kwargs: WriteOptions,

    pub predict_kwargs: PredictOptions,

    /// Seconds of history to retrieve each cycle
    pub past: f64,

    /// Log one timing line per cycle at info level
    #[serde(default)]
    pub verbose: bool,

    #[serde(default = "default_prediction_prefix")]
    pub prediction_prefix: String,

    /// Port for the health/metrics server; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_prediction_prefix() -> String {
    DEFAULT_PREDICTION_PREFIX.to_string()
}

impl RuntimeConfig {
    /// Load from a YAML file, with `POLLER_*` environment overrides
    /// (nested keys separated by `__`)
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let load_err = |source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        };

        let config: Self = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix("POLLER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(load_err)?
            .try_deserialize()
            .map_err(load_err)?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.past.is_finite() || self.past < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "past".to_string(),
                reason: format!("expected a non-negative number of seconds, got {}", self.past),
            });
        }
        if self.prediction_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "prediction_prefix".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.write_kwargs.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "write_kwargs.name".to_string(),
                reason: "destination table name must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Training configuration, kept as the loaded nested mapping
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    root: Value,
}

impl TrainingConfig {
    /// Load the saved training YAML as-is. Keys keep their case since
    /// target and feature names appear as mapping keys (e.g. `lags`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let root: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self::from_value(root))
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// `model_kwargs.class`
    pub fn model_class(&self) -> Result<&str, ConfigError> {
        require_str(&self.root, "model_kwargs.class")
    }

    /// `model_kwargs.quantiles`, if the model was trained with custom levels
    pub fn quantiles(&self) -> Result<Option<Vec<f64>>, ConfigError> {
        const KEY: &str = "model_kwargs.quantiles";
        match lookup(&self.root, KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|q| {
                    q.as_f64().ok_or_else(|| ConfigError::InvalidType {
                        key: KEY.to_string(),
                        expected: "a list of numbers",
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(ConfigError::InvalidType {
                key: KEY.to_string(),
                expected: "a list of numbers",
            }),
        }
    }

    /// `dataset_kwargs`, the dataset construction parameters
    pub fn dataset_kwargs(&self) -> Result<&Value, ConfigError> {
        let value = require(&self.root, "dataset_kwargs")?;
        if !value.is_object() {
            return Err(ConfigError::InvalidType {
                key: "dataset_kwargs".to_string(),
                expected: "a mapping",
            });
        }
        Ok(value)
    }
}

/// Walk a dotted key path through nested mappings
pub(crate) fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(value, |node, part| node.get(part))
}

pub(crate) fn require<'a>(value: &'a Value, key: &str) -> Result<&'a Value, ConfigError> {
    lookup(value, key).ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

pub(crate) fn require_str<'a>(value: &'a Value, key: &str) -> Result<&'a str, ConfigError> {
    require(value, key)?
        .as_str()
        .ok_or_else(|| ConfigError::InvalidType {
            key: key.to_string(),
            expected: "a string",
        })
}

pub(crate) fn require_usize(value: &Value, key: &str) -> Result<usize, ConfigError> {
    let node = require(value, key)?;
    node.as_u64()
        .or_else(|| {
            // YAML may hand back integral floats
            node.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as u64)
        })
        .map(|n| n as usize)
        .ok_or_else(|| ConfigError::InvalidType {
            key: key.to_string(),
            expected: "a non-negative integer",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::IfExists;
    use serde_json::json;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_runtime_config_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "predict.yaml",
            r#"
model_path: model.onnx
train_kwargs: train.yaml
engine_kwargs:
  url: sqlite:///tmp/predictions.db
write_kwargs:
  name: predictions
  if_exists: append
predict_kwargs:
  mode: quantiles
past: 3600
verbose: true
"#,
        );

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.model_path, PathBuf::from("model.onnx"));
        assert_eq!(config.write_kwargs.name, "predictions");
        assert_eq!(config.write_kwargs.if_exists, IfExists::Append);
        assert!(config.write_kwargs.index);
        assert_eq!(config.predict_kwargs.mode, PredictMode::Quantiles);
        assert_eq!(config.past, 3600.0);
        assert!(config.verbose);
        assert_eq!(config.prediction_prefix, "pred");
        assert_eq!(config.metrics_port, None);
    }

    #[test]
    fn test_runtime_config_rejects_unknown_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "predict.yaml",
            r#"
model_path: model.onnx
train_kwargs: train.yaml
engine_kwargs:
  url: sqlite://:memory:
write_kwargs:
  name: predictions
  if_exists: append
predict_kwargs:
  mode: bogus
past: 60
"#,
        );

        let err = RuntimeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_runtime_config_requires_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "predict.yaml",
            r#"
model_path: model.onnx
train_kwargs: train.yaml
engine_kwargs:
  url: sqlite:///tmp/predictions.db
write_kwargs:
  name: predictions
predict_kwargs:
  mode: quantiles
past: 60
"#,
        );

        let err = RuntimeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
        assert!(err.to_string().contains("if_exists"));
    }

    #[test]
    fn test_runtime_config_missing_file() {
        let err = RuntimeConfig::load("/nonexistent/predict.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
    }

    #[test]
    fn test_training_config_accessors() {
        let training = TrainingConfig::from_value(json!({
            "model_kwargs": {"class": "DeepAR", "quantiles": [0.1, 0.5, 0.9]},
            "dataset_kwargs": {"dataset_kwargs": {"max_encoder_length": 60}}
        }));

        assert_eq!(training.model_class().unwrap(), "DeepAR");
        assert_eq!(training.quantiles().unwrap(), Some(vec![0.1, 0.5, 0.9]));
        assert!(training.dataset_kwargs().unwrap().is_object());
    }

    #[test]
    fn test_training_config_missing_class() {
        let training = TrainingConfig::from_value(json!({"model_kwargs": {}}));
        let err = training.model_class().unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(ref k) if k == "model_kwargs.class"));
    }

    #[test]
    fn test_training_config_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "train.yaml",
            r#"
model_kwargs:
  class: TemporalFusionTransformer
dataset_kwargs:
  dataset_kwargs:
    max_encoder_length: 60
    max_prediction_length: 10
  features_kwargs:
    resample_kwargs:
      rule: 1min
"#,
        );

        let training = TrainingConfig::load(&path).unwrap();
        assert_eq!(training.model_class().unwrap(), "TemporalFusionTransformer");
        assert_eq!(training.quantiles().unwrap(), None);
    }

    #[test]
    fn test_training_config_keeps_key_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "train.yaml",
            r#"
model_kwargs:
  class: DeepAR
dataset_kwargs:
  dataset_kwargs:
    max_encoder_length: 60
    max_prediction_length: 10
    target: [Target-A]
  features_kwargs:
    resample_kwargs:
      rule: 1min
    lags:
      Target-A: [1, 2]
"#,
        );

        let training = TrainingConfig::load(&path).unwrap();
        let params = InferenceParams::from_training(&training, 600.0).unwrap();

        let lags = &params.kwargs()["features_kwargs"]["lags"];
        assert_eq!(lags["Target-A"], json!([1, 2]));
        assert!(lags.get("target-a").is_none());
        assert_eq!(params.target_names().unwrap(), vec!["Target-A".to_string()]);
    }

    #[test]
    fn test_training_config_load_errors() {
        let err = TrainingConfig::load("/nonexistent/train.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(&dir, "train.yaml", "model_kwargs: [unclosed\n");
        let err = TrainingConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_require_usize_accepts_integral_float() {
        let value = json!({"a": {"b": 10.0, "c": 1.5, "d": "x"}});
        assert_eq!(require_usize(&value, "a.b").unwrap(), 10);
        assert!(require_usize(&value, "a.c").is_err());
        assert!(require_usize(&value, "a.d").is_err());
        assert!(matches!(
            require_usize(&value, "a.e"),
            Err(ConfigError::MissingKey(_))
        ));
    }
}
