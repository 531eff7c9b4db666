//! Prediction sinks
//!
//! A fresh sink is built from the engine config for every write; nothing
//! is pooled across poll cycles.

mod sqlite;

pub use sqlite::{SqliteSink, SqliteSinkFactory};

use crate::models::PredictionTable;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

/// Behaviour when the destination table already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    /// Refuse to write
    #[default]
    Fail,
    /// Drop and recreate the table
    Replace,
    /// Insert into the existing table
    Append,
}

/// Table write options (`write_kwargs`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteOptions {
    /// Destination table
    pub name: String,

    /// Required; a missing value is a config error
    pub if_exists: IfExists,

    /// Write the row time index as a column
    #[serde(default = "default_index")]
    pub index: bool,

    /// Name of the index column (defaults to `index`)
    #[serde(default)]
    pub index_label: Option<String>,
}

fn default_index() -> bool {
    true
}

impl WriteOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            if_exists: IfExists::default(),
            index: default_index(),
            index_label: None,
        }
    }

    pub fn index_label(&self) -> &str {
        self.index_label.as_deref().unwrap_or("index")
    }
}

/// Trait for prediction sink implementations
#[async_trait]
pub trait PredictionSink: Send + Sync {
    /// Persist the table, returning the number of rows written
    async fn write(&self, table: &PredictionTable, options: &WriteOptions) -> Result<usize>;
}

/// Builds a sink connection for one write
pub trait SinkFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn PredictionSink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_options_defaults() {
        let options: WriteOptions =
            serde_json::from_str(r#"{"name": "predictions", "if_exists": "fail"}"#).unwrap();
        assert_eq!(options, WriteOptions::new("predictions"));
        assert_eq!(options.if_exists, IfExists::Fail);
        assert!(options.index);
        assert_eq!(options.index_label(), "index");
    }

    #[test]
    fn test_write_options_full() {
        let options: WriteOptions = serde_json::from_str(
            r#"{"name": "p", "if_exists": "append", "index": false, "index_label": "ts"}"#,
        )
        .unwrap();
        assert_eq!(options.if_exists, IfExists::Append);
        assert!(!options.index);
        assert_eq!(options.index_label(), "ts");
    }

    #[test]
    fn test_write_options_require_if_exists() {
        let err = serde_json::from_str::<WriteOptions>(r#"{"name": "predictions"}"#).unwrap_err();
        assert!(err.to_string().contains("if_exists"));
    }

    #[test]
    fn test_write_options_bad_if_exists() {
        let result: Result<WriteOptions, _> =
            serde_json::from_str(r#"{"name": "p", "if_exists": "merge"}"#);
        assert!(result.is_err());
    }
}
