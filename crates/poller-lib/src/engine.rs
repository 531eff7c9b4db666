//! SQL engine handles
//!
//! Engine URLs follow SQLAlchemy conventions:
//! - `sqlite://` is an in-memory database
//! - `sqlite:///relative/path.db` is relative to the working directory
//! - `sqlite:////absolute/path.db` is an absolute path

use anyhow::{Context, Result};
use percent_encoding::percent_decode_str;
use rusqlite::Connection;
use std::path::PathBuf;
use url::Url;

/// Where a SQLite engine points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    Memory,
    File(PathBuf),
}

/// Lightweight engine description; connections are opened on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteEngine {
    target: SqliteTarget,
}

impl SqliteEngine {
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("Invalid engine URL: {}", raw))?;
        if url.scheme() != "sqlite" {
            anyhow::bail!("Unsupported engine scheme {:?} in {}", url.scheme(), raw);
        }
        if url.host_str().map(|h| !h.is_empty()).unwrap_or(false) {
            anyhow::bail!("SQLite engine URLs take no host: {}", raw);
        }

        // One leading slash separates the (empty) authority from the path
        let encoded = url.path().strip_prefix('/').unwrap_or(url.path());
        let path = percent_decode_str(encoded)
            .decode_utf8()
            .with_context(|| format!("Engine URL path is not valid UTF-8: {}", raw))?;
        let target = match &*path {
            "" | ":memory:" => SqliteTarget::Memory,
            path => SqliteTarget::File(PathBuf::from(path)),
        };

        Ok(Self { target })
    }

    pub fn target(&self) -> &SqliteTarget {
        &self.target
    }

    pub fn connect(&self) -> Result<Connection> {
        match &self.target {
            SqliteTarget::Memory => {
                Connection::open_in_memory().context("Failed to open in-memory database")
            }
            SqliteTarget::File(path) => Connection::open(path)
                .with_context(|| format!("Failed to open database {}", path.display())),
        }
    }
}

/// Quote an SQL identifier
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
