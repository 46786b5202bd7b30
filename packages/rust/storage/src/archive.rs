//! Archive store: durable history of every selected article.
//!
//! Rows are never deleted. A run demotes the posted rows it did not re-select
//! and upserts its selection as `posted`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Value, params};
use tracing::{debug, info, instrument, warn};

use newsdigest_shared::{
    ArchiveRecord, ArchiveStats, ArchivedItem, IntegrityReport, NewsDigestError, PromotionReport,
    Result, Validator,
};

use crate::integrity::{self, TableSpec};
use crate::migrations;
use crate::{connect, format_timestamp, parse_timestamp};

const SELECT_COLUMNS: &str = "SELECT id, title, link, image, summary, cluster, source, score, status, selected_at FROM archived_items";

const TABLE_SPEC: TableSpec = TableSpec {
    label: "archive",
    table: "archived_items",
    columns: &[
        "id",
        "title",
        "link",
        "image",
        "summary",
        "cluster",
        "source",
        "score",
        "status",
        "selected_at",
    ],
    min_indexes: 3,
    warn_if_empty: true,
};

/// Handle to the archive database.
pub struct ArchiveStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    validator: Validator,
    readonly: bool,
}

impl ArchiveStore {
    /// Open or create the archive database at `path` in read-write mode.
    pub async fn open(path: &Path, validator: Validator) -> Result<Self> {
        let (db, conn) = connect(path).await?;
        migrations::run_migrations(&conn, &migrations::archive_migrations()).await?;

        Ok(Self {
            db,
            conn,
            validator,
            readonly: false,
        })
    }

    /// Open an existing archive for reading only. No migrations are applied.
    pub async fn open_readonly(path: &Path, validator: Validator) -> Result<Self> {
        if !path.exists() {
            return Err(NewsDigestError::Storage(format!(
                "archive database not found at {}",
                path.display()
            )));
        }
        let (db, conn) = connect(path).await?;

        Ok(Self {
            db,
            conn,
            validator,
            readonly: true,
        })
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(NewsDigestError::Storage(
                "archive is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Promotion
    // -----------------------------------------------------------------------

    /// Reconcile the archive with a new selection.
    ///
    /// Posted rows outside the selection are demoted first, then every record
    /// is validated and upserted as `posted`. A record that fails is counted
    /// and skipped.
    #[instrument(skip_all, fields(selected = records.len()))]
    pub async fn promote(&self, records: &[ArchiveRecord]) -> Result<PromotionReport> {
        self.check_writable()?;

        let links: Vec<String> = records.iter().map(|r| r.link.clone()).collect();
        let mut report = PromotionReport {
            demoted: self.demote_unselected(&links).await?,
            ..PromotionReport::default()
        };

        let now = format_timestamp(Utc::now());
        for record in records {
            let record = match self.validator.validate_complete(record) {
                Ok(r) => r,
                Err(errors) => {
                    warn!(link = %record.link, %errors, "record rejected by validation");
                    report.failed += 1;
                    continue;
                }
            };

            match self.upsert_posted(&record, &now).await {
                Ok(true) => report.new += 1,
                Ok(false) => report.reselected += 1,
                Err(e) => {
                    warn!(link = %record.link, error = %e, "failed to archive record");
                    report.failed += 1;
                }
            }
        }

        info!(
            new = report.new,
            reselected = report.reselected,
            failed = report.failed,
            demoted = report.demoted,
            "promotion complete"
        );
        Ok(report)
    }

    /// Flip every posted row whose link is not in `selected_links` to archived.
    ///
    /// An empty selection demotes every posted row.
    pub async fn demote_unselected(&self, selected_links: &[String]) -> Result<usize> {
        self.check_writable()?;

        let demoted = if selected_links.is_empty() {
            self.conn
                .execute(
                    "UPDATE archived_items SET status = 'archived' WHERE status = 'posted'",
                    params![],
                )
                .await
        } else {
            let placeholders: Vec<String> = (1..=selected_links.len())
                .map(|i| format!("?{i}"))
                .collect();
            let sql = format!(
                "UPDATE archived_items SET status = 'archived'
                 WHERE status = 'posted' AND link NOT IN ({})",
                placeholders.join(", ")
            );
            let values: Vec<Value> = selected_links
                .iter()
                .map(|l| Value::Text(l.clone()))
                .collect();
            self.conn
                .execute(&sql, libsql::params::Params::Positional(values))
                .await
        }
        .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        debug!(demoted, "demoted unselected items");
        Ok(demoted as usize)
    }

    /// Insert a new posted row or refresh an existing one. Returns `true` if inserted.
    async fn upsert_posted(&self, record: &ArchiveRecord, now: &str) -> Result<bool> {
        let refreshed = self
            .conn
            .execute(
                "UPDATE archived_items SET selected_at = ?1, status = 'posted' WHERE link = ?2",
                params![now, record.link.as_str()],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
        if refreshed > 0 {
            return Ok(false);
        }

        self.conn
            .execute(
                "INSERT INTO archived_items
                    (title, link, image, summary, cluster, source, score, status, selected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'posted', ?8)",
                params![
                    record.title.as_str(),
                    record.link.as_str(),
                    record.image.as_deref(),
                    record.summary.as_str(),
                    record.cluster,
                    record.source.as_str(),
                    record.score,
                    now,
                ],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Read contract
    // -----------------------------------------------------------------------

    /// The `limit` most recently selected posted items.
    pub async fn latest_posted(&self, limit: usize) -> Result<Vec<ArchivedItem>> {
        self.query_many(
            &format!(
                "{SELECT_COLUMNS} WHERE status = 'posted'
                 ORDER BY selected_at DESC, id DESC LIMIT ?1"
            ),
            vec![Value::Integer(limit as i64)],
        )
        .await
    }

    /// The `limit` most recently selected posted items of one cluster.
    pub async fn posted_by_cluster(&self, cluster: i64, limit: usize) -> Result<Vec<ArchivedItem>> {
        self.query_many(
            &format!(
                "{SELECT_COLUMNS} WHERE status = 'posted' AND cluster = ?1
                 ORDER BY selected_at DESC, id DESC LIMIT ?2"
            ),
            vec![Value::Integer(cluster), Value::Integer(limit as i64)],
        )
        .await
    }

    /// Items of either status last selected within `[from, to]`, newest first.
    pub async fn selected_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ArchivedItem>> {
        self.query_many(
            &format!(
                "{SELECT_COLUMNS} WHERE selected_at >= ?1 AND selected_at <= ?2
                 ORDER BY selected_at DESC, id DESC LIMIT ?3"
            ),
            vec![
                Value::Text(format_timestamp(from)),
                Value::Text(format_timestamp(to)),
                Value::Integer(limit as i64),
            ],
        )
        .await
    }

    /// Items of either status whose title or summary contains `term`.
    ///
    /// Matching ignores ASCII case. `%` and `_` in the term match literally.
    pub async fn search(&self, term: &str, limit: usize) -> Result<Vec<ArchivedItem>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }

        self.query_many(
            &format!(
                "{SELECT_COLUMNS} WHERE title LIKE ?1 ESCAPE '\\' OR summary LIKE ?1 ESCAPE '\\'
                 ORDER BY selected_at DESC, id DESC LIMIT ?2"
            ),
            vec![
                Value::Text(format!("%{}%", escape_like(term))),
                Value::Integer(limit as i64),
            ],
        )
        .await
    }

    /// One posted item by id. Archived rows are not served.
    pub async fn get_posted(&self, id: i64) -> Result<Option<ArchivedItem>> {
        self.query_one(
            &format!("{SELECT_COLUMNS} WHERE id = ?1 AND status = 'posted'"),
            Value::Integer(id),
        )
        .await
    }

    /// Look up an item by link regardless of status.
    pub async fn get_by_link(&self, link: &str) -> Result<Option<ArchivedItem>> {
        self.query_one(
            &format!("{SELECT_COLUMNS} WHERE link = ?1"),
            Value::Text(link.to_string()),
        )
        .await
    }

    /// Links of every currently posted row.
    pub async fn posted_links(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT link FROM archived_items WHERE status = 'posted' ORDER BY link",
                params![],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        let mut links = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let link: String = row
                .get(0)
                .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
            links.push(link);
        }
        Ok(links)
    }

    /// Totals, recency windows, and per-cluster counts.
    pub async fn stats(&self) -> Result<ArchiveStats> {
        self.stats_at(Utc::now()).await
    }

    async fn stats_at(&self, now: DateTime<Utc>) -> Result<ArchiveStats> {
        let week = format_timestamp(now - chrono::Duration::days(7));
        let month = format_timestamp(now - chrono::Duration::days(30));

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(status = 'posted'), 0),
                        COALESCE(SUM(status = 'archived'), 0),
                        COALESCE(SUM(selected_at >= ?1), 0),
                        COALESCE(SUM(selected_at >= ?2), 0)
                 FROM archived_items",
                params![week.as_str(), month.as_str()],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        let mut stats = ArchiveStats::default();
        if let Ok(Some(row)) = rows.next().await {
            let count = |i: i32| -> Result<u64> {
                row.get::<i64>(i)
                    .map(|n| n.max(0) as u64)
                    .map_err(|e| NewsDigestError::Storage(e.to_string()))
            };
            stats.total = count(0)?;
            stats.posted = count(1)?;
            stats.archived = count(2)?;
            stats.selected_last_7_days = count(3)?;
            stats.selected_last_30_days = count(4)?;
        }

        let mut rows = self
            .conn
            .query(
                "SELECT cluster, COUNT(*) FROM archived_items GROUP BY cluster ORDER BY cluster",
                params![],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        let mut by_cluster = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let cluster: i64 = row
                .get(0)
                .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
            by_cluster.insert(cluster, count.max(0) as u64);
        }
        stats.by_cluster = by_cluster;

        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Run lock
    // -----------------------------------------------------------------------

    /// Take the advisory run lock for `run_id`.
    ///
    /// A lock held for longer than `stale_after` is taken over. Otherwise a
    /// held lock yields [`NewsDigestError::RunLocked`].
    pub async fn acquire_run_lock(&self, run_id: &str, stale_after: Duration) -> Result<()> {
        self.check_writable()?;

        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| NewsDigestError::config(format!("invalid lock staleness: {e}")))?;
        let cutoff = format_timestamp(now - stale_after);

        if let Some((holder, since)) = self.current_lock().await? {
            if since >= cutoff {
                return Err(NewsDigestError::RunLocked { holder, since });
            }
            warn!(%holder, %since, "taking over stale run lock");
        }

        let acquired = self
            .conn
            .execute(
                "INSERT INTO run_lock (id, run_id, acquired_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE
                    SET run_id = excluded.run_id, acquired_at = excluded.acquired_at
                    WHERE run_lock.acquired_at < ?3",
                params![run_id, format_timestamp(now), cutoff.as_str()],
            )
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        if acquired == 0 {
            // Another run won the race between the read and the upsert.
            let (holder, since) = self.current_lock().await?.unwrap_or_default();
            return Err(NewsDigestError::RunLocked { holder, since });
        }

        debug!(run_id, "run lock acquired");
        Ok(())
    }

    /// Release the run lock if `run_id` still holds it.
    pub async fn release_run_lock(&self, run_id: &str) -> Result<bool> {
        self.check_writable()?;

        let released = self
            .conn
            .execute("DELETE FROM run_lock WHERE run_id = ?1", params![run_id])
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
        Ok(released > 0)
    }

    async fn current_lock(&self) -> Result<Option<(String, String)>> {
        let mut rows = self
            .conn
            .query("SELECT run_id, acquired_at FROM run_lock WHERE id = 1", params![])
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let holder: String = row
                    .get(0)
                    .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
                let since: String = row
                    .get(1)
                    .map_err(|e| NewsDigestError::Storage(e.to_string()))?;
                Ok(Some((holder, since)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(NewsDigestError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Structural check of the archive table.
    pub async fn integrity_check(&self) -> IntegrityReport {
        integrity::check_table(&self.conn, &TABLE_SPEC).await
    }

    async fn query_many(&self, sql: &str, values: Vec<Value>) -> Result<Vec<ArchivedItem>> {
        let mut rows = self
            .conn
            .query(sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_archived_item(&row)?);
        }
        Ok(results)
    }

    async fn query_one(&self, sql: &str, key: Value) -> Result<Option<ArchivedItem>> {
        let mut rows = self
            .conn
            .query(sql, libsql::params::Params::Positional(vec![key]))
            .await
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_archived_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(NewsDigestError::Storage(e.to_string())),
        }
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn row_to_archived_item(row: &libsql::Row) -> Result<ArchivedItem> {
    let text = |i: i32| -> Result<String> {
        row.get::<String>(i)
            .map_err(|e| NewsDigestError::Storage(e.to_string()))
    };

    Ok(ArchivedItem {
        id: row
            .get::<i64>(0)
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?,
        title: text(1)?,
        link: text(2)?,
        image: row.get::<String>(3).ok(),
        summary: text(4)?,
        cluster: row
            .get::<i64>(5)
            .map_err(|e| NewsDigestError::Storage(e.to_string()))?,
        source: text(6)?,
        score: row.get::<f64>(7).ok(),
        status: text(8)?.parse()?,
        selected_at: parse_timestamp(&text(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use newsdigest_shared::{Status, ValidationConfig, failure_sentinel};
    use uuid::Uuid;

    fn validator() -> Validator {
        Validator::new(ValidationConfig::default(), 5)
    }

    /// Create a temp file store for testing.
    async fn test_store() -> ArchiveStore {
        let tmp = std::env::temp_dir().join(format!("nd_archive_{}.db", Uuid::now_v7()));
        ArchiveStore::open(&tmp, validator())
            .await
            .expect("open test db")
    }

    fn record(n: u32) -> ArchiveRecord {
        ArchiveRecord {
            title: format!("Notícia {n}"),
            link: format!("https://exame.com/marketing/noticia-{n}"),
            image: None,
            source: "Exame".into(),
            summary: format!("Resumo da notícia {n}."),
            cluster: i64::from(n % 5),
            score: Some(f64::from(n)),
            status: Status::Posted,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let store = test_store().await;
        assert_eq!(migrations::schema_version(&store.conn).await, 2);
    }

    #[tokio::test]
    async fn first_selection_posts_every_record() {
        let store = test_store().await;
        let selection: Vec<ArchiveRecord> = (1..=15).map(record).collect();

        let report = store.promote(&selection).await.unwrap();
        assert_eq!(
            report,
            PromotionReport {
                new: 15,
                reselected: 0,
                failed: 0,
                demoted: 0,
            }
        );

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 15);
        assert_eq!(stats.posted, 15);
        assert_eq!(stats.selected_last_7_days, 15);
        assert_eq!(stats.by_cluster.values().sum::<u64>(), 15);
    }

    #[tokio::test]
    async fn unselected_posted_items_are_archived() {
        let store = test_store().await;
        store.promote(&[record(1), record(2)]).await.unwrap();

        let report = store.promote(&[record(2), record(3)]).await.unwrap();
        assert_eq!(report.demoted, 1);
        assert_eq!(report.new, 1);
        assert_eq!(report.reselected, 1);

        let a = store.get_by_link(&record(1).link).await.unwrap().unwrap();
        assert_eq!(a.status, Status::Archived);
        assert_eq!(
            store.posted_links().await.unwrap(),
            vec![record(2).link, record(3).link]
        );
    }

    #[tokio::test]
    async fn reselected_archived_item_is_posted_again() {
        let store = test_store().await;
        store.promote(&[record(1)]).await.unwrap();
        store.promote(&[record(2)]).await.unwrap();

        let before = store.get_by_link(&record(1).link).await.unwrap().unwrap();
        assert_eq!(before.status, Status::Archived);

        let report = store.promote(&[record(1)]).await.unwrap();
        assert_eq!(report.reselected, 1);
        assert_eq!(report.new, 0);

        let after = store.get_by_link(&record(1).link).await.unwrap().unwrap();
        assert_eq!(after.status, Status::Posted);
        assert_eq!(after.id, before.id);
        assert!(after.selected_at > before.selected_at);
        assert_eq!(store.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn promotion_is_idempotent() {
        let store = test_store().await;
        let selection: Vec<ArchiveRecord> = (1..=4).map(record).collect();
        store.promote(&selection).await.unwrap();
        let report = store.promote(&selection).await.unwrap();

        assert_eq!(report.reselected, 4);
        assert_eq!(report.demoted, 0);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.posted, 4);
    }

    #[tokio::test]
    async fn invalid_records_are_counted_not_fatal() {
        let store = test_store().await;
        let mut bad = record(2);
        bad.summary = failure_sentinel("timeout");
        let mut out_of_range = record(3);
        out_of_range.cluster = 9;

        let report = store
            .promote(&[record(1), bad, out_of_range])
            .await
            .unwrap();
        assert_eq!(report.new, 1);
        assert_eq!(report.failed, 2);
        assert!(store.get_by_link(&record(2).link).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_selection_demotes_everything() {
        let store = test_store().await;
        store.promote(&[record(1), record(2)]).await.unwrap();
        let report = store.promote(&[]).await.unwrap();
        assert_eq!(report.demoted, 2);
        assert!(store.posted_links().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_contract() {
        let store = test_store().await;
        store.promote(&[record(1), record(2), record(3)]).await.unwrap();
        store.promote(&[record(3), record(4)]).await.unwrap();

        let latest = store.latest_posted(10).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert!(latest.iter().all(|i| i.status == Status::Posted));
        assert_eq!(store.latest_posted(1).await.unwrap().len(), 1);

        let archived = store.get_by_link(&record(1).link).await.unwrap().unwrap();
        assert!(store.get_posted(archived.id).await.unwrap().is_none());

        let posted = &latest[0];
        let found = store.get_posted(posted.id).await.unwrap().unwrap();
        assert_eq!(found.link, posted.link);
        assert!(store.get_posted(9999).await.unwrap().is_none());
    }

    fn links(items: &[ArchivedItem]) -> Vec<String> {
        let mut links: Vec<String> = items.iter().map(|i| i.link.clone()).collect();
        links.sort();
        links
    }

    #[tokio::test]
    async fn posted_items_by_cluster() {
        let store = test_store().await;
        let selection: Vec<ArchiveRecord> = (1..=10).map(record).collect();
        store.promote(&selection).await.unwrap();
        // 1 and 6 stay posted in cluster 1, 3 and 8 (cluster 3) get archived
        store.promote(&[record(1), record(6), record(2)]).await.unwrap();

        let cluster_one = store.posted_by_cluster(1, 10).await.unwrap();
        assert_eq!(links(&cluster_one), vec![record(1).link, record(6).link]);
        assert!(cluster_one.iter().all(|i| i.cluster == 1 && i.status == Status::Posted));

        assert!(store.posted_by_cluster(3, 10).await.unwrap().is_empty());
        assert_eq!(store.posted_by_cluster(1, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn selection_history_by_date_range() {
        let store = test_store().await;
        let start = Utc::now();
        store.promote(&[record(1), record(2)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mid = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.promote(&[record(3)]).await.unwrap();
        let end = Utc::now();

        // demoted rows keep their last selection time and are still listed
        let first = store.selected_between(start, mid, 10).await.unwrap();
        assert_eq!(links(&first), vec![record(1).link, record(2).link]);
        assert!(first.iter().all(|i| i.status == Status::Archived));

        let second = store.selected_between(mid, end, 10).await.unwrap();
        assert_eq!(links(&second), vec![record(3).link]);

        assert_eq!(store.selected_between(start, end, 10).await.unwrap().len(), 3);
        assert_eq!(store.selected_between(start, end, 2).await.unwrap().len(), 2);
        assert!(store.selected_between(end, start, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_matches_title_or_summary() {
        let store = test_store().await;
        let mut promo = record(1);
        promo.title = "Campanha de 50% OFF no varejo".into();
        let mut ai = record(2);
        ai.summary = "Marcas adotam Inteligência Artificial em anúncios.".into();
        store
            .promote(&[promo.clone(), ai.clone(), record(3)])
            .await
            .unwrap();
        store.promote(&[record(3)]).await.unwrap();

        let hits = store.search("inteligência artificial", 10).await.unwrap();
        assert_eq!(links(&hits), vec![ai.link.clone()]);
        assert_eq!(hits[0].status, Status::Archived);

        assert_eq!(links(&store.search("50%", 10).await.unwrap()), vec![promo.link]);
        // wildcards in the term are literal
        assert!(store.search("5_%", 10).await.unwrap().is_empty());

        // "Notícia 2", "Notícia 3" and promo's summary all match
        assert_eq!(store.search("notícia", 10).await.unwrap().len(), 3);
        assert_eq!(store.search("notícia", 2).await.unwrap().len(), 2);
        assert!(store.search("   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_recency_windows() {
        let store = test_store().await;
        store.promote(&[record(1), record(2)]).await.unwrap();

        let future = Utc::now() + chrono::Duration::days(10);
        let stats = store.stats_at(future).await.unwrap();
        assert_eq!(stats.selected_last_7_days, 0);
        assert_eq!(stats.selected_last_30_days, 2);

        let far_future = Utc::now() + chrono::Duration::days(40);
        assert_eq!(store.stats_at(far_future).await.unwrap().selected_last_30_days, 0);
    }

    #[tokio::test]
    async fn run_lock_excludes_second_run() {
        let store = test_store().await;
        let hour = Duration::from_secs(3600);

        store.acquire_run_lock("run-a", hour).await.unwrap();
        let err = store.acquire_run_lock("run-b", hour).await.unwrap_err();
        assert!(matches!(err, NewsDigestError::RunLocked { ref holder, .. } if holder == "run-a"));

        // only the holder can release
        assert!(!store.release_run_lock("run-b").await.unwrap());
        assert!(store.release_run_lock("run-a").await.unwrap());
        store.acquire_run_lock("run-b", hour).await.unwrap();
    }

    #[tokio::test]
    async fn stale_run_lock_is_taken_over() {
        let store = test_store().await;
        store
            .acquire_run_lock("crashed", Duration::from_secs(3600))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        store
            .acquire_run_lock("fresh", Duration::from_millis(1))
            .await
            .unwrap();
        assert!(!store.release_run_lock("crashed").await.unwrap());
        assert!(store.release_run_lock("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn readonly_refuses_writes() {
        let tmp = std::env::temp_dir().join(format!("nd_archive_{}.db", Uuid::now_v7()));
        assert!(ArchiveStore::open_readonly(&tmp, validator()).await.is_err());

        let rw = ArchiveStore::open(&tmp, validator()).await.unwrap();
        rw.promote(&[record(1)]).await.unwrap();
        drop(rw);

        let ro = ArchiveStore::open_readonly(&tmp, validator()).await.unwrap();
        assert_eq!(ro.latest_posted(5).await.unwrap().len(), 1);
        assert!(ro.promote(&[record(2)]).await.is_err());
        assert!(ro.acquire_run_lock("x", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn integrity_of_fresh_archive() {
        let store = test_store().await;
        let report = store.integrity_check().await;
        assert!(report.is_ok(), "{:?}", report.errors);
        assert!(report.warnings.iter().any(|w| w.contains("empty")));
    }
}
