//! Structural checks run against a store before a pipeline run.
//!
//! Errors gate the run; warnings are reported and ignored.

use libsql::{Connection, params};
use newsdigest_shared::IntegrityReport;

/// What a healthy table looks like.
pub(crate) struct TableSpec {
    /// Label used in messages ("staging", "archive").
    pub label: &'static str,
    pub table: &'static str,
    pub columns: &'static [&'static str],
    /// Fewer indexes than this produces a warning.
    pub min_indexes: usize,
    /// Whether an empty table deserves a warning.
    pub warn_if_empty: bool,
}

/// Run every check for one table and collect the findings.
pub(crate) async fn check_table(conn: &Connection, spec: &TableSpec) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    let label = spec.label;
    let table = spec.table;

    // --- File-level corruption ---
    match query_strings(conn, "PRAGMA quick_check").await {
        Ok(lines) if lines.first().map(String::as_str) == Some("ok") => {}
        Ok(lines) => report.errors.push(format!(
            "{label} database failed quick_check: {}",
            lines.join("; ")
        )),
        Err(e) => {
            report
                .errors
                .push(format!("{label} database is unreadable: {e}"));
            return report;
        }
    }

    // --- Table and columns ---
    let columns = match query_strings_at(conn, &format!("PRAGMA table_info({table})"), 1).await {
        Ok(columns) => columns,
        Err(e) => {
            report
                .errors
                .push(format!("{label}: cannot inspect table {table}: {e}"));
            return report;
        }
    };
    if columns.is_empty() {
        report
            .errors
            .push(format!("{label}: table {table} not found"));
        return report;
    }
    let missing: Vec<&str> = spec
        .columns
        .iter()
        .copied()
        .filter(|c| !columns.iter().any(|have| have == c))
        .collect();
    if !missing.is_empty() {
        report.errors.push(format!(
            "{label}: table {table} is missing columns: {}",
            missing.join(", ")
        ));
        return report;
    }

    // --- Data consistency ---
    let checks = [
        (
            format!("SELECT COUNT(*) FROM (SELECT link FROM {table} GROUP BY link HAVING COUNT(*) > 1)"),
            "duplicated links",
        ),
        (
            format!("SELECT COUNT(*) FROM {table} WHERE title IS NULL OR trim(title) = ''"),
            "rows with an empty title",
        ),
        (
            format!("SELECT COUNT(*) FROM {table} WHERE link IS NULL OR trim(link) = ''"),
            "rows with an empty link",
        ),
    ];
    for (sql, what) in &checks {
        match query_count(conn, sql).await {
            Ok(0) => {}
            Ok(n) => report.errors.push(format!("{label}: {n} {what} in {table}")),
            Err(e) => report
                .errors
                .push(format!("{label}: check for {what} failed: {e}")),
        }
    }

    if spec.warn_if_empty {
        if let Ok(0) = query_count(conn, &format!("SELECT COUNT(*) FROM {table}")).await {
            report.warnings.push(format!("{label}: table {table} is empty"));
        }
    }

    // --- Indexes ---
    match query_strings_at(conn, &format!("PRAGMA index_list({table})"), 1).await {
        Ok(indexes) if indexes.len() < spec.min_indexes => report.warnings.push(format!(
            "{label}: only {} indexes on {table}, expected at least {}",
            indexes.len(),
            spec.min_indexes
        )),
        Ok(_) => {}
        Err(e) => report
            .warnings
            .push(format!("{label}: cannot list indexes of {table}: {e}")),
    }

    report
}

async fn query_count(conn: &Connection, sql: &str) -> Result<u64, libsql::Error> {
    let mut rows = conn.query(sql, params![]).await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)?.max(0) as u64),
        None => Ok(0),
    }
}

async fn query_strings(conn: &Connection, sql: &str) -> Result<Vec<String>, libsql::Error> {
    query_strings_at(conn, sql, 0).await
}

async fn query_strings_at(
    conn: &Connection,
    sql: &str,
    column: i32,
) -> Result<Vec<String>, libsql::Error> {
    let mut rows = conn.query(sql, params![]).await?;
    let mut values = Vec::new();
    while let Some(row) = rows.next().await? {
        values.push(row.get::<String>(column)?);
    }
    Ok(values)
}
