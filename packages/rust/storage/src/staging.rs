//! Staging store: the per-run table of candidate articles.
//!
//! Items move `collected → processed → clustered`. The store is purged once a
//! run finishes selection, so nothing here survives across runs.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use libsql::{Connection, Database, params};
use tracing::{debug, info, warn};

use newsdigest_shared::{
    Candidate, FAILURE_SENTINEL_PREFIX, IntegrityReport, NewsDigestError, Result, Stage,
    StagingCounts, StagingItem, ValidationErrors, Validator,
};

use crate::integrity::{self, TableSpec};
use crate::migrations;
use crate::{connect, format_timestamp, parse_timestamp};

const SELECT_COLUMNS: &str = "SELECT id, title, link, image, source, summary, cluster, collected_at, processed_at, stage FROM staging_items";

const TABLE_SPEC: TableSpec = TableSpec {
    label: "staging",
    table: "staging_items",
    columns: &[
        "id",
        "title",
        "link",
        "image",
        "source",
        "summary",
        "cluster",
        "collected_at",
        "processed_at",
        "stage",
    ],
    min_indexes: 2,
    warn_if_empty: false,
};

/// Result of offering a candidate to the staging store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The link is already staged; the existing row is left untouched.
    Duplicate,
    Invalid(ValidationErrors),
}

impl InsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// SQLite sidecar files removed along with the database file.
const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// An open database and its connection. Replaced when the file is recreated.
struct Handle {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

/// Handle to the staging database.
pub struct StagingStore {
    handle: Mutex<Option<Handle>>,
    path: PathBuf,
    validator: Validator,
    purge_retries: u32,
    purge_retry_delay: Duration,
}

impl StagingStore {
    /// Open or create the staging database at `path`.
    pub async fn open(path: &Path, validator: Validator) -> Result<Self> {
        let handle = open_handle(path).await?;

        Ok(Self {
            handle: Mutex::new(Some(handle)),
            path: path.to_path_buf(),
            validator,
            purge_retries: 3,
            purge_retry_delay: Duration::from_secs(1),
        })
    }

    /// Override how often [`purge`](Self::purge) retries reclaiming a locked file.
    pub fn with_purge_retry(mut self, retries: u32, delay: Duration) -> Self {
        self.purge_retries = retries.max(1);
        self.purge_retry_delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<Handle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connection to the current file. Fails if a purge could not reopen it.
    fn conn(&self) -> Result<Connection> {
        self.lock()
            .as_ref()
            .map(|h| h.conn.clone())
            .ok_or_else(|| {
                NewsDigestError::Storage(format!(
                    "staging store at {} is closed",
                    self.path.display()
                ))
            })
    }

    // -----------------------------------------------------------------------
    // Stage transitions
    // -----------------------------------------------------------------------

    /// Stage a collected candidate. Duplicate links are rejected, never overwritten.
    pub async fn insert_collected(&self, candidate: &Candidate) -> Result<InsertOutcome> {
        let candidate = match self.validator.validate_basic(candidate) {
            Ok(c) => c,
            Err(errors) => {
                debug!(link = %candidate.link, %errors, "candidate rejected");
                return Ok(InsertOutcome::Invalid(errors));
            }
        };

        let now = format_timestamp(Utc::now());
        let inserted = self
            .conn()?
            .execute(
                "INSERT INTO staging_items (title, link, image, source, collected_at, stage)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'collected')
                 ON CONFLICT(link) DO NOTHING",
                params![
                    candidate.title.as_str(),
                    candidate.link.as_str(),
                    candidate.image.as_deref(),
                    candidate.source.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        if inserted == 0 {
            debug!(link = %candidate.link, "duplicate link, skipping");
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    /// Record the summary of a collected item. Failure sentinels are stored too.
    ///
    /// Returns `false` when the link is unknown, not in `collected`, or the
    /// summary fails validation.
    pub async fn mark_processed(&self, link: &str, summary: &str) -> Result<bool> {
        let summary = match self.validator.validate_summary(summary) {
            Ok(s) => s,
            Err(errors) => {
                warn!(link, %errors, "summary rejected");
                return Ok(false);
            }
        };

        let now = format_timestamp(Utc::now());
        let updated = self
            .conn()?
            .execute(
                "UPDATE staging_items
                 SET summary = ?1, processed_at = ?2, stage = 'processed'
                 WHERE link = ?3 AND stage = 'collected'",
                params![summary.as_str(), now.as_str(), link],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
        Ok(updated == 1)
    }

    /// Assign a cluster to a processed item whose summary is not a failure sentinel.
    pub async fn mark_clustered(&self, link: &str, cluster: i64) -> Result<bool> {
        if let Err(errors) = self.validator.validate_cluster(cluster) {
            warn!(link, %errors, "cluster rejected");
            return Ok(false);
        }

        let updated = self
            .conn()?
            .execute(
                "UPDATE staging_items
                 SET cluster = ?1, stage = 'clustered'
                 WHERE link = ?2 AND stage = 'processed' AND substr(summary, 1, length(?3)) <> ?3",
                params![cluster, link, FAILURE_SENTINEL_PREFIX],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
        Ok(updated == 1)
    }

    // -----------------------------------------------------------------------
    // Stage queries
    // -----------------------------------------------------------------------

    /// Items waiting for text extraction and summarization, oldest first.
    pub async fn items_awaiting_summary(&self) -> Result<Vec<StagingItem>> {
        self.query_items(
            &format!("{SELECT_COLUMNS} WHERE stage = 'collected' ORDER BY collected_at, id"),
            None,
        )
        .await
    }

    /// Summarized items waiting for clustering, oldest first. Sentinels are skipped.
    pub async fn items_awaiting_cluster(&self) -> Result<Vec<StagingItem>> {
        self.query_items(
            &format!(
                "{SELECT_COLUMNS} WHERE stage = 'processed' AND substr(summary, 1, length(?1)) <> ?1
                 ORDER BY collected_at, id"
            ),
            Some(FAILURE_SENTINEL_PREFIX),
        )
        .await
    }

    /// Clustered items eligible for selection, most recently processed first.
    pub async fn items_ready_for_selection(&self) -> Result<Vec<StagingItem>> {
        self.query_items(
            &format!(
                "{SELECT_COLUMNS} WHERE stage = 'clustered' AND substr(summary, 1, length(?1)) <> ?1
                 ORDER BY processed_at DESC, id DESC"
            ),
            Some(FAILURE_SENTINEL_PREFIX),
        )
        .await
    }

    /// Look up one staged item by link.
    pub async fn get(&self, link: &str) -> Result<Option<StagingItem>> {
        let mut rows = self
            .conn()?
            .query(&format!("{SELECT_COLUMNS} WHERE link = ?1"), params![link])
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_staging_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(NewsDigestError::Storage(e.to_string())),
        }
    }

    /// Row counts per lifecycle milestone.
    pub async fn counts(&self) -> Result<StagingCounts> {
        let mut rows = self
            .conn()?
            .query(
                "SELECT COUNT(*),
                        COUNT(summary),
                        COUNT(cluster),
                        COALESCE(SUM(stage = 'clustered' AND substr(summary, 1, length(?1)) <> ?1), 0)
                 FROM staging_items",
                params![FAILURE_SENTINEL_PREFIX],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(StagingCounts::default()),
            Err(e) => return Err(NewsDigestError::Storage(e.to_string())),
        };
        let count = |i: i32| -> Result<u64> {
            row.get::<i64>(i)
                .map(|n| n.max(0) as u64)
                .map_err(|e| NewsDigestError::Storage(e.to_string()))
        };

        Ok(StagingCounts {
            total: count(0)?,
            with_summary: count(1)?,
            with_cluster: count(2)?,
            ready_for_selection: count(3)?,
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Delete every staged row, then remove and recreate the backing file.
    ///
    /// Removal is retried while the file is locked. If it stays locked the
    /// emptied file is reused. Returns `false` if the rows could not be
    /// deleted or the store could not be reopened; never panics.
    pub async fn purge(&self) -> bool {
        if let Ok(conn) = self.conn() {
            match conn.execute("DELETE FROM staging_items", params![]).await {
                Ok(removed) => info!(removed, "staging rows deleted"),
                Err(e) => {
                    warn!(error = %e, "failed to purge staging store");
                    return false;
                }
            }
        }

        // Close the file before removing it.
        drop(self.lock().take());
        let removed = self.remove_backing_file().await;

        match open_handle(&self.path).await {
            Ok(handle) => {
                *self.lock() = Some(handle);
                if removed {
                    info!(path = %self.path.display(), "staging file recreated");
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "could not reopen staging store");
                false
            }
        }
    }

    async fn remove_backing_file(&self) -> bool {
        for attempt in 1..=self.purge_retries {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {
                    self.remove_sidecars();
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
                Err(e) if attempt < self.purge_retries => {
                    warn!(attempt, error = %e, "staging file busy, retrying removal");
                    tokio::time::sleep(self.purge_retry_delay).await;
                }
                Err(e) => {
                    warn!(
                        attempts = self.purge_retries,
                        error = %e,
                        "could not remove staging file, keeping the emptied one"
                    );
                }
            }
        }
        false
    }

    fn remove_sidecars(&self) {
        for suffix in SIDECAR_SUFFIXES {
            let mut sidecar = self.path.clone().into_os_string();
            sidecar.push(suffix);
            match std::fs::remove_file(&sidecar) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => debug!(error = %e, "stale sidecar left behind"),
            }
        }
    }

    /// Structural check of the staging table.
    pub async fn integrity_check(&self) -> IntegrityReport {
        match self.conn() {
            Ok(conn) => integrity::check_table(&conn, &TABLE_SPEC).await,
            Err(e) => IntegrityReport {
                errors: vec![e.to_string()],
                warnings: Vec::new(),
            },
        }
    }

    async fn query_items(&self, sql: &str, sentinel: Option<&str>) -> Result<Vec<StagingItem>> {
        let conn = self.conn()?;
        let rows = match sentinel {
            Some(prefix) => conn.query(sql, params![prefix]).await,
            None => conn.query(sql, params![]).await,
        };
        let mut rows = rows.map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_staging_item(&row)?);
        }
        Ok(results)
    }
}

/// Connect to `path` and bring its schema up to date.
async fn open_handle(path: &Path) -> Result<Handle> {
    let (db, conn) = connect(path).await?;
    migrations::run_migrations(&conn, &migrations::staging_migrations()).await?;
    Ok(Handle { db, conn })
}

fn row_to_staging_item(row: &libsql::Row) -> Result<StagingItem> {
    let processed_at = match row.get::<String>(8).ok() {
        Some(ts) => Some(parse_timestamp(&ts)?),
        None => None,
    };
    let stage: Stage = row
        .get::<String>(9)
        .map_err(|e| NewsDigestError::Storage(e.to_string()))?
        .parse()?;

    Ok(StagingItem {
        id: row
            .get::<i64>(0)
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?,
        title: row
            .get::<String>(1)
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?,
        link: row
            .get::<String>(2)
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?,
        image: row.get::<String>(3).ok(),
        source: row
            .get::<String>(4)
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?,
        summary: row.get::<String>(5).ok(),
        cluster: row.get::<i64>(6).ok(),
        collected_at: parse_timestamp(
            &row.get::<String>(7)
                .map_err(|e| NewsDigestError::Storage(e.to_string()))?,
        )?,
        processed_at,
        stage,
    })
}
