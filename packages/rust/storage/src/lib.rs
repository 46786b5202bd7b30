//! libSQL storage layer for the two pipeline stores.
//!
//! - [`StagingStore`]: ephemeral per-run table of in-flight articles
//! - [`ArchiveStore`]: durable selection history served to readers
//!
//! Every mutating call commits on its own; there is no cross-call transaction.
//! Both stores validate records with a [`Validator`](newsdigest_shared::Validator)
//! before writing.

mod archive;
mod integrity;
mod migrations;
mod staging;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database};
use newsdigest_shared::{NewsDigestError, Result};

pub use archive::ArchiveStore;
pub use staging::{InsertOutcome, StagingStore};

/// Open (creating if needed) a local libSQL database and connect to it.
async fn connect(path: &Path) -> Result<(Database, Connection)> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| NewsDigestError::io(parent, e))?;
    }

    let db = libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

    let conn = db
        .connect()
        .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

    Ok((db, conn))
}

/// Timestamp format stored in every `*_at` column.
///
/// Fixed-width UTC with microseconds, so text comparison orders chronologically.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| NewsDigestError::Storage(format!("invalid timestamp '{value}': {e}")))
}
