//! SQLite prediction sink

use super::{IfExists, PredictionSink, SinkFactory, WriteOptions};
use crate::config::EngineConfig;
use crate::engine::{quote_ident, SqliteEngine};
use crate::models::PredictionTable;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use tracing::debug;

/// Creates a [`SqliteSink`] per write
#[derive(Debug, Clone)]
pub struct SqliteSinkFactory {
    engine: SqliteEngine,
}

impl SqliteSinkFactory {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            engine: SqliteEngine::from_url(&config.url)?,
        })
    }
}

impl SinkFactory for SqliteSinkFactory {
    fn connect(&self) -> Result<Box<dyn PredictionSink>> {
        Ok(Box::new(SqliteSink::new(self.engine.clone())))
    }
}

/// Writes prediction tables with `to_sql`-like semantics
pub struct SqliteSink {
    engine: SqliteEngine,
}

impl SqliteSink {
    pub fn new(engine: SqliteEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PredictionSink for SqliteSink {
    async fn write(&self, table: &PredictionTable, options: &WriteOptions) -> Result<usize> {
        let engine = self.engine.clone();
        let table = table.clone();
        let options = options.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = engine.connect()?;
            write_table(&mut conn, &table, &options)
        })
        .await
        .context("Sink write task panicked")?
    }
}

/// Write all rows in one transaction
pub(crate) fn write_table(
    conn: &mut Connection,
    table: &PredictionTable,
    options: &WriteOptions,
) -> Result<usize> {
    let name = quote_ident(&options.name);
    let tx = conn.transaction()?;

    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [&options.name],
        |row| row.get(0),
    )?;

    match (exists, options.if_exists) {
        (true, IfExists::Fail) => {
            anyhow::bail!("Table {} already exists (if_exists = fail)", options.name)
        }
        (true, IfExists::Replace) => {
            tx.execute(&format!("DROP TABLE {}", name), [])?;
        }
        _ => {}
    }

    let mut columns: Vec<String> = Vec::with_capacity(table.columns.len() + 2);
    let mut definitions: Vec<String> = Vec::with_capacity(table.columns.len() + 2);
    if options.index {
        let label = quote_ident(options.index_label());
        definitions.push(format!("{} TEXT", label));
        columns.push(label);
    }
    definitions.push(format!("{} TEXT", quote_ident("group")));
    columns.push(quote_ident("group"));
    for column in &table.columns {
        let column = quote_ident(column);
        definitions.push(format!("{} REAL", column));
        columns.push(column);
    }

    tx.execute(
        &format!("CREATE TABLE IF NOT EXISTS {} ({})", name, definitions.join(", ")),
        [],
    )
    .with_context(|| format!("Failed to create table {}", options.name))?;

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let insert = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        name,
        columns.join(", "),
        placeholders.join(", ")
    );

    {
        let mut stmt = tx
            .prepare(&insert)
            .with_context(|| format!("Failed to prepare insert into {}", options.name))?;
        for row in &table.rows {
            let mut values: Vec<SqlValue> = Vec::with_capacity(columns.len());
            if options.index {
                values.push(SqlValue::Text(
                    row.index.to_rfc3339_opts(SecondsFormat::Millis, true),
                ));
            }
            values.push(SqlValue::Text(row.group.clone()));
            values.extend(row.values.iter().map(|v| SqlValue::Real(*v)));
            stmt.execute(rusqlite::params_from_iter(values))?;
        }
    }

    tx.commit()?;
    debug!(table = %options.name, rows = table.rows.len(), "Wrote predictions");
    Ok(table.rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PredictionRow;
    use chrono::{TimeZone, Utc};

    fn table() -> PredictionTable {
        PredictionTable {
            columns: vec!["pred-x-0.1".to_string(), "pred-x-0.9".to_string()],
            rows: (0..3)
                .map(|i| PredictionRow {
                    index: Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap(),
                    time_idx: i,
                    group: "a".to_string(),
                    values: vec![i as f64, i as f64 + 0.5],
                })
                .collect(),
        }
    }

    fn count(conn: &Connection, name: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(name)), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_write_creates_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        let written = write_table(&mut conn, &table(), &WriteOptions::new("predictions")).unwrap();

        assert_eq!(written, 3);
        assert_eq!(count(&conn, "predictions"), 3);

        let (index, group, high): (String, String, f64) = conn
            .query_row(
                "SELECT \"index\", \"group\", \"pred-x-0.9\" FROM predictions ORDER BY \"index\" DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(index, "2023-11-14T22:15:20.000Z");
        assert_eq!(group, "a");
        assert_eq!(high, 2.5);
    }

    #[test]
    fn test_if_exists_fail() {
        let mut conn = Connection::open_in_memory().unwrap();
        let options = WriteOptions::new("predictions");
        write_table(&mut conn, &table(), &options).unwrap();

        assert!(write_table(&mut conn, &table(), &options).is_err());
        assert_eq!(count(&conn, "predictions"), 3);
    }

    #[test]
    fn test_if_exists_append_and_replace() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut options = WriteOptions::new("predictions");
        options.if_exists = IfExists::Append;

        write_table(&mut conn, &table(), &options).unwrap();
        write_table(&mut conn, &table(), &options).unwrap();
        assert_eq!(count(&conn, "predictions"), 6);

        options.if_exists = IfExists::Replace;
        write_table(&mut conn, &table(), &options).unwrap();
        assert_eq!(count(&conn, "predictions"), 3);
    }

    #[test]
    fn test_without_index_column() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut options = WriteOptions::new("predictions");
        options.index = false;
        write_table(&mut conn, &table(), &options).unwrap();

        let has_index: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM pragma_table_info('predictions') WHERE name = 'index')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(!has_index);
    }

    #[tokio::test]
    async fn test_factory_builds_fresh_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:///{}", dir.path().join("out.db").display());
        let factory = SqliteSinkFactory::from_config(&EngineConfig { url }).unwrap();

        let mut options = WriteOptions::new("predictions");
        options.if_exists = IfExists::Append;
        for _ in 0..2 {
            let sink = factory.connect().unwrap();
            sink.write(&table(), &options).await.unwrap();
        }

        let conn = Connection::open(dir.path().join("out.db")).unwrap();
        assert_eq!(count(&conn, "predictions"), 6);
    }
}
