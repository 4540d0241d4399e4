//! Schema versions for the libSQL job store.
//!
//! Applied versions are recorded in `job_store_schema`. Opening a store runs
//! every newer entry of `MIGRATIONS` in order.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "processing_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS processing_jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'queued',
                payload TEXT NOT NULL DEFAULT '{}',
                retry_count INTEGER NOT NULL DEFAULT 0,
                total_items INTEGER NOT NULL DEFAULT 0,
                processed_items INTEGER NOT NULL DEFAULT 0,
                failed_items INTEGER NOT NULL DEFAULT 0,
                progress_percentage REAL NOT NULL DEFAULT 0,
                current_item TEXT,
                result_data TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processing_jobs_status ON processing_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_processing_jobs_type_status ON processing_jobs(job_type, status);
            CREATE INDEX IF NOT EXISTS idx_processing_jobs_started ON processing_jobs(status, started_at);
            CREATE INDEX IF NOT EXISTS idx_processing_jobs_expires ON processing_jobs(expires_at);

            CREATE TABLE IF NOT EXISTS processing_job_items (
                job_id TEXT NOT NULL REFERENCES processing_jobs(id) ON DELETE CASCADE,
                item_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                result_data TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                PRIMARY KEY (job_id, item_id)
            );
            CREATE INDEX IF NOT EXISTS idx_processing_job_items_status ON processing_job_items(job_id, status);
        "#,
    },
];

/// Bring the job store schema up to the newest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS job_store_schema (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create job_store_schema: {e}")))?;

    let from = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        tracing::debug!(version = from, "Job store schema up to date");
        return Ok(());
    }

    for migration in &pending {
        apply(conn, migration).await?;
    }
    tracing::info!(
        from,
        to = pending.last().map(|m| m.version).unwrap_or(from),
        "Job store schema upgraded"
    );
    Ok(())
}

/// Run one migration and record its version.
async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let label = format!("V{} {}", migration.version, migration.name);
    tracing::info!(migration = %label, "Applying job store migration");

    conn.execute_batch(migration.sql)
        .await
        .map_err(|e| DatabaseError::Migration(format!("{label}: {e}")))?;
    conn.execute(
        "INSERT OR IGNORE INTO job_store_schema (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("record {label}: {e}")))?;
    Ok(())
}

/// Newest recorded schema version, 0 for a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM job_store_schema", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("applied_version: {e}")))?;

    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("applied_version: {e}")))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| DatabaseError::Migration(format!("applied_version: {e}")))
}
