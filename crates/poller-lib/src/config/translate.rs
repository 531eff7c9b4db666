//! Translation of training-time dataset parameters into inference-time ones

use super::{lookup, parse_resample_rule, require, require_str, require_usize, ConfigError, TrainingConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Dataset parameters for one inference poll
///
/// Built once from the training config and cloned for every cycle, so a
/// source that mutates its copy never leaks into the next cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    kwargs: Value,
    max_encoder_length: usize,
    max_prediction_length: usize,
    resample: Duration,
    start: f64,
    end: f64,
}

impl InferenceParams {
    /// Derive inference parameters from a training config.
    ///
    /// The training `dataset_kwargs` are copied and overridden: no split,
    /// a window from `past` seconds ago up to one forecast horizon ahead,
    /// and the dataset switched to predict mode.
    pub fn from_training(training: &TrainingConfig, past: f64) -> Result<Self, ConfigError> {
        let mut kwargs = training.dataset_kwargs()?.clone();

        let max_prediction_length =
            require_usize(&kwargs, "dataset_kwargs.max_prediction_length")
                .map_err(|e| nest(e, "dataset_kwargs"))?;
        let max_encoder_length = require_usize(&kwargs, "dataset_kwargs.max_encoder_length")
            .map_err(|e| nest(e, "dataset_kwargs"))?;
        let rule = require_str(&kwargs, "features_kwargs.resample_kwargs.rule")
            .map_err(|e| nest(e, "dataset_kwargs"))?;
        let resample = parse_resample_rule(rule)?;

        let start = -past;
        let end = max_prediction_length as f64 * resample.as_secs_f64();

        // dataset_kwargs is a mapping, checked by TrainingConfig
        if let Value::Object(map) = &mut kwargs {
            map.insert("split".to_string(), Value::Null);
            map.insert("start".to_string(), json!(start));
            map.insert("end".to_string(), json!(end));
        }
        match kwargs.get_mut("dataset_kwargs") {
            Some(Value::Object(inner)) => {
                inner.insert("predict_mode".to_string(), Value::Bool(true));
            }
            _ => {
                return Err(ConfigError::InvalidType {
                    key: "dataset_kwargs.dataset_kwargs".to_string(),
                    expected: "a mapping",
                })
            }
        }

        Ok(Self {
            kwargs,
            max_encoder_length,
            max_prediction_length,
            resample,
            start,
            end,
        })
    }

    /// The translated dataset mapping
    pub fn kwargs(&self) -> &Value {
        &self.kwargs
    }

    pub fn max_encoder_length(&self) -> usize {
        self.max_encoder_length
    }

    pub fn max_prediction_length(&self) -> usize {
        self.max_prediction_length
    }

    /// Encoder plus prediction length
    pub fn min_length(&self) -> usize {
        self.max_encoder_length + self.max_prediction_length
    }

    pub fn resample(&self) -> Duration {
        self.resample
    }

    pub fn resample_seconds(&self) -> f64 {
        self.resample.as_secs_f64()
    }

    /// Window start relative to now, in seconds (negative = past)
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Window end relative to now, in seconds
    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn predict_mode(&self) -> bool {
        lookup(&self.kwargs, "dataset_kwargs.predict_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// `dataset_kwargs.target`, a single name or a list
    pub fn target_names(&self) -> Result<Vec<String>, ConfigError> {
        const KEY: &str = "dataset_kwargs.dataset_kwargs.target";
        let invalid = || ConfigError::InvalidType {
            key: KEY.to_string(),
            expected: "a string or a list of strings",
        };

        match require(&self.kwargs, "dataset_kwargs.target").map_err(|e| nest(e, "dataset_kwargs"))? {
            Value::String(name) => Ok(vec![name.clone()]),
            Value::Array(items) if !items.is_empty() => items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
                .collect(),
            _ => Err(invalid()),
        }
    }

    /// `source_kwargs`, where the live data comes from
    pub fn source(&self) -> Result<SourceConfig, ConfigError> {
        let raw = require(&self.kwargs, "source_kwargs").map_err(|e| nest(e, "dataset_kwargs"))?;
        serde_json::from_value(raw.clone()).map_err(|e| ConfigError::InvalidValue {
            key: "dataset_kwargs.source_kwargs".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Location of the raw observations feeding the dataset
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    /// SQLAlchemy-style URL, e.g. `sqlite:///var/lib/poller/metrics.db`
    pub url: String,
    pub table: String,
    /// Column holding epoch seconds
    #[serde(default = "default_time_column")]
    pub time_column: String,
    #[serde(default = "default_group_column")]
    pub group_column: String,
}

fn default_time_column() -> String {
    "time".to_string()
}

fn default_group_column() -> String {
    "group".to_string()
}

/// Report keys relative to the training config root
fn nest(err: ConfigError, parent: &str) -> ConfigError {
    match err {
        ConfigError::MissingKey(key) => ConfigError::MissingKey(format!("{}.{}", parent, key)),
        ConfigError::InvalidType { key, expected } => ConfigError::InvalidType {
            key: format!("{}.{}", parent, key),
            expected,
        },
        other => other,
    }
}
