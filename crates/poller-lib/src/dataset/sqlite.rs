//! SQLite-backed dataset source
//!
//! Reads raw observations for the retrieval window, resamples them to the
//! training granularity (mean per bucket, forward-filled gaps) and, in
//! predict mode, appends one horizon of empty future rows per group.

use super::DatasetSource;
use crate::config::InferenceParams;
use crate::engine::{quote_ident, SqliteEngine};
use crate::models::{DatasetSnapshot, FrameRow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use std::collections::BTreeMap;
use tracing::debug;

/// One raw observation read from the source table
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Epoch seconds
    pub time: f64,
    pub group: String,
    /// One value per target
    pub values: Vec<Option<f64>>,
}

/// Dataset source reading from the table named in `source_kwargs`
#[derive(Debug, Clone, Default)]
pub struct SqliteSource;

impl SqliteSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatasetSource for SqliteSource {
    async fn refresh(&self, params: InferenceParams) -> Result<Option<DatasetSnapshot>> {
        let source = params.source()?;
        let targets = params.target_names()?;
        let engine = SqliteEngine::from_url(&source.url)?;

        let now = Utc::now();
        let now_secs = epoch_seconds(now);
        let from = now_secs + params.start();

        let columns = targets.clone();
        let observations = tokio::task::spawn_blocking(move || -> Result<Vec<Observation>> {
            let conn = engine.connect()?;
            let time = quote_ident(&source.time_column);
            let sql = format!(
                "SELECT {time}, {group}, {values} FROM {table} WHERE {time} >= ?1 AND {time} <= ?2 ORDER BY {time}",
                time = time,
                group = quote_ident(&source.group_column),
                values = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
                table = quote_ident(&source.table),
            );

            let mut stmt = conn
                .prepare(&sql)
                .with_context(|| format!("Failed to query source table {}", source.table))?;
            let rows = stmt.query_map(rusqlite::params![from, now_secs], |row| {
                let group: SqlValue = row.get(1)?;
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    values.push(row.get::<_, Option<f64>>(i + 2)?);
                }
                Ok(Observation {
                    time: row.get(0)?,
                    group: group_label(group),
                    values,
                })
            })?;

            let observations = rows
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read source rows")?;
            Ok(observations)
        })
        .await
        .context("Source query task panicked")??;

        debug!(observations = observations.len(), "Fetched source observations");

        Ok(build_snapshot(observations, targets, &params))
    }
}

/// Resample observations into a snapshot, or `None` when no group has a
/// full encoder window
pub fn build_snapshot(
    observations: Vec<Observation>,
    target_names: Vec<String>,
    params: &InferenceParams,
) -> Option<DatasetSnapshot> {
    let period = params.resample_seconds();
    let n_targets = target_names.len();
    let encoder_length = params.max_encoder_length();
    let horizon = params.max_prediction_length();

    // group -> bucket -> per-target (sum, count)
    let mut buckets: BTreeMap<String, BTreeMap<i64, Vec<(f64, usize)>>> = BTreeMap::new();
    for obs in observations {
        let bucket = (obs.time / period).floor() as i64;
        let slots = buckets
            .entry(obs.group)
            .or_default()
            .entry(bucket)
            .or_insert_with(|| vec![(0.0, 0); n_targets]);
        for (slot, value) in slots.iter_mut().zip(obs.values) {
            if let Some(v) = value {
                slot.0 += v;
                slot.1 += 1;
            }
        }
    }

    let mut frame = Vec::new();
    for (group, series) in buckets {
        let (Some(&first), Some(&last)) = (series.keys().next(), series.keys().next_back()) else {
            continue;
        };

        // Consecutive buckets, gaps carry the previous mean forward
        let mut filled: Vec<(i64, Vec<Option<f64>>)> = Vec::new();
        let mut previous: Vec<Option<f64>> = vec![None; n_targets];
        for bucket in first..=last {
            if let Some(slots) = series.get(&bucket) {
                for (prev, (sum, count)) in previous.iter_mut().zip(slots) {
                    if *count > 0 {
                        *prev = Some(sum / *count as f64);
                    }
                }
            }
            filled.push((bucket, previous.clone()));
        }

        if filled.len() < encoder_length.max(1) {
            debug!(group = %group, buckets = filled.len(), "Not enough history for group");
            continue;
        }

        let encoder = &filled[filled.len() - encoder_length.max(1)..];
        for (bucket, values) in encoder {
            frame.push(FrameRow {
                index: bucket_time(*bucket, period),
                time_idx: *bucket,
                group: group.clone(),
                values: values.clone(),
            });
        }

        if params.predict_mode() {
            for step in 1..=horizon as i64 {
                let bucket = last + step;
                frame.push(FrameRow {
                    index: bucket_time(bucket, period),
                    time_idx: bucket,
                    group: group.clone(),
                    values: vec![None; n_targets],
                });
            }
        }
    }

    if frame.is_empty() {
        return None;
    }

    Some(DatasetSnapshot {
        target_names,
        max_encoder_length: encoder_length,
        max_prediction_length: horizon,
        frame,
    })
}

fn epoch_seconds(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

fn bucket_time(bucket: i64, period: f64) -> DateTime<Utc> {
    let millis = (bucket as f64 * period * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn group_label(value: SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => f.to_string(),
        SqlValue::Text(s) => s,
        SqlValue::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
    }
}
