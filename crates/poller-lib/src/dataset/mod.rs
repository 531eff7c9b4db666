//! Dataset refresh from live data
//!
//! A source turns translated inference parameters into a prediction-ready
//! snapshot. Returning `Ok(None)` means there is not enough history yet to
//! form an encoder window; that is a normal steady state, not an error.

mod sqlite;

pub use sqlite::{build_snapshot, Observation, SqliteSource};

use crate::config::InferenceParams;
use crate::models::DatasetSnapshot;
use anyhow::Result;
use async_trait::async_trait;

/// Trait for dataset source implementations
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Build the snapshot for one poll cycle
    async fn refresh(&self, params: InferenceParams) -> Result<Option<DatasetSnapshot>>;
}
