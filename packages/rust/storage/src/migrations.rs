//! SQL migration definitions for the staging and archive databases.
//!
//! Migrations are applied in order on database open. Each database keeps its
//! own `schema_migrations` table.

use libsql::{Connection, params};
use newsdigest_shared::{NewsDigestError, Result};

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Staging database migrations, in ascending version order.
pub(crate) fn staging_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial staging schema",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS staging_items (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    title        TEXT NOT NULL,
    link         TEXT NOT NULL UNIQUE,
    image        TEXT,
    source       TEXT NOT NULL,
    summary      TEXT,
    cluster      INTEGER,
    collected_at TEXT NOT NULL,
    processed_at TEXT,
    stage        TEXT NOT NULL DEFAULT 'collected'
                 CHECK (stage IN ('collected', 'processed', 'clustered')),
    CHECK ((cluster IS NULL) = (stage <> 'clustered')),
    CHECK ((processed_at IS NULL) = (summary IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_staging_stage ON staging_items(stage, collected_at);
CREATE INDEX IF NOT EXISTS idx_staging_source ON staging_items(source);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}

/// Archive database migrations, in ascending version order.
pub(crate) fn archive_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial archive schema",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS archived_items (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    title       TEXT NOT NULL,
    link        TEXT NOT NULL UNIQUE,
    image       TEXT,
    summary     TEXT NOT NULL,
    cluster     INTEGER NOT NULL,
    source      TEXT NOT NULL,
    score       REAL,
    status      TEXT NOT NULL DEFAULT 'posted'
                CHECK (status IN ('posted', 'archived')),
    selected_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_archive_status_selected ON archived_items(status, selected_at);
CREATE INDEX IF NOT EXISTS idx_archive_cluster ON archived_items(cluster);
CREATE INDEX IF NOT EXISTS idx_archive_source ON archived_items(source);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Advisory run lock",
            sql: r#"
CREATE TABLE IF NOT EXISTS run_lock (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    run_id      TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}

/// Apply every migration newer than the database's current version.
pub(crate) async fn run_migrations(conn: &Connection, migrations: &[Migration]) -> Result<()> {
    let current_version = schema_version(conn).await;

    for migration in migrations {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                NewsDigestError::Storage(format!("migration v{} failed: {e}", migration.version))
            })?;
        }
    }
    Ok(())
}

/// Get the current schema version, or 0 if no migrations have been applied.
pub(crate) async fn schema_version(conn: &Connection) -> u32 {
    let result = conn
        .query("SELECT MAX(version) FROM schema_migrations", params![])
        .await;

    match result {
        Ok(mut rows) => {
            if let Ok(Some(row)) = rows.next().await {
                row.get::<u32>(0).unwrap_or(0)
            } else {
                0
            }
        }
        Err(_) => 0, // Table doesn't exist yet
    }
}
