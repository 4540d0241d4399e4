//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC strings so SQL string comparison orders them.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{ItemStatus, Job, JobItem, JobKind, JobStatus, Progress};
use crate::store::migrations;
use crate::store::traits::{JobStore, StatusCounts};

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for every column.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_json(value: Option<&serde_json::Value>) -> Result<libsql::Value, DatabaseError> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map(opt_text)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_json(s: Option<String>) -> Result<Option<serde_json::Value>, DatabaseError> {
    s.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn integer(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn real(row: &libsql::Row, idx: i32) -> Result<f64, DatabaseError> {
    row.get::<f64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn count_column(row: &libsql::Row, idx: i32) -> Result<u32, DatabaseError> {
    integer(row, idx).map(|v| v.clamp(0, u32::MAX as i64) as u32)
}

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id = text(row, 0)?;
    let job_type = text(row, 1)?;
    let priority = text(row, 2)?;
    let status = text(row, 3)?;
    let payload = text(row, 4)?;
    let created_str = text(row, 13)?;
    let updated_str = text(row, 16)?;
    let expires_str = text(row, 17)?;

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        kind: job_type
            .parse::<JobKind>()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        priority: priority.parse().map_err(DatabaseError::Serialization)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        retry_count: count_column(row, 5)?,
        total_items: count_column(row, 6)?,
        processed_items: count_column(row, 7)?,
        failed_items: count_column(row, 8)?,
        progress_percentage: real(row, 9)?,
        current_item: row.get(10).ok(),
        result_data: parse_json(row.get(11).ok())?,
        error_message: row.get(12).ok(),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&row.get(14).ok()),
        completed_at: parse_optional_datetime(&row.get(15).ok()),
        updated_at: parse_datetime(&updated_str),
        expires_at: parse_datetime(&expires_str),
    })
}

fn row_to_item(row: &libsql::Row) -> Result<JobItem, DatabaseError> {
    let job_id = text(row, 0)?;
    let status = text(row, 2)?;
    let created_str = text(row, 5)?;

    Ok(JobItem {
        job_id: Uuid::parse_str(&job_id).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        item_id: text(row, 1)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        result_data: parse_json(row.get(3).ok())?,
        error_message: row.get(4).ok(),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&row.get(6).ok()),
        completed_at: parse_optional_datetime(&row.get(7).ok()),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, job_type, priority, status, payload, retry_count, total_items, processed_items, failed_items, progress_percentage, current_item, result_data, error_message, created_at, started_at, completed_at, updated_at, expires_at";

const ITEM_COLUMNS: &str =
    "job_id, item_id, status, result_data, error_message, created_at, started_at, completed_at";

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO processing_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    job.id.to_string(),
                    job.kind.as_str(),
                    job.priority.as_str(),
                    job.status.as_str(),
                    payload,
                    job.retry_count as i64,
                    job.total_items as i64,
                    job.processed_items as i64,
                    job.failed_items as i64,
                    job.progress_percentage,
                    opt_text(job.current_item.clone()),
                    opt_json(job.result_data.as_ref())?,
                    opt_text(job.error_message.clone()),
                    ts(job.created_at),
                    opt_text(job.started_at.map(ts)),
                    opt_text(job.completed_at.map(ts)),
                    ts(job.updated_at),
                    ts(job.expires_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, job_type = %job.kind, "Job inserted");
        Ok(())
    }

    async fn insert_items(&self, job_id: Uuid, item_ids: &[String]) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        for item_id in item_ids {
            self.conn()
                .execute(
                    "INSERT OR IGNORE INTO processing_job_items (job_id, item_id, status, created_at) VALUES (?1, ?2, 'pending', ?3)",
                    params![job_id.to_string(), item_id.as_str(), now.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("insert_items: {e}")))?;
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_job(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn list_items(&self, job_id: Uuid) -> Result<Vec<JobItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM processing_job_items WHERE job_id = ?1 ORDER BY rowid"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_items: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_items: {e}")))?
        {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }

    // ── Status transitions ──────────────────────────────────────────

    async fn mark_processing(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let at = ts(at);
        let changed = self
            .conn()
            .execute(
                "UPDATE processing_jobs SET status = 'processing', started_at = COALESCE(started_at, ?1), updated_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![at, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_processing: {e}")))?;

        debug!(job_id = %id, applied = changed > 0, "Job marked processing");
        Ok(changed > 0)
    }

    async fn requeue(&self, id: Uuid, retry_count: u32) -> Result<bool, DatabaseError> {
        let now = ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE processing_jobs SET status = 'queued', retry_count = ?1, processed_items = 0, failed_items = 0, progress_percentage = 0, current_item = NULL, updated_at = ?2 WHERE id = ?3 AND status = 'processing'",
                params![retry_count as i64, now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue: {e}")))?;

        debug!(job_id = %id, retry_count, applied = changed > 0, "Job requeued");
        Ok(changed > 0)
    }

    async fn complete_job(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        processed: u32,
        failed: u32,
    ) -> Result<bool, DatabaseError> {
        let now = ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE processing_jobs SET status = 'completed', result_data = ?1, processed_items = ?2, failed_items = ?3, progress_percentage = 100, current_item = NULL, completed_at = ?4, updated_at = ?4 WHERE id = ?5 AND status = 'processing'",
                params![
                    opt_json(Some(result))?,
                    processed as i64,
                    failed as i64,
                    now,
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;
        Ok(changed > 0)
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError> {
        let now = ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE processing_jobs SET status = 'failed', error_message = ?1, current_item = NULL, completed_at = ?2, updated_at = ?2 WHERE id = ?3 AND status = 'processing'",
                params![error, now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_job: {e}")))?;
        Ok(changed > 0)
    }

    async fn cancel_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE processing_jobs SET status = 'cancelled', current_item = NULL, completed_at = ?1, updated_at = ?1 WHERE id = ?2 AND status IN ('queued', 'processing')",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_job: {e}")))?;
        Ok(changed > 0)
    }

    // ── Progress ────────────────────────────────────────────────────

    async fn update_progress(&self, id: Uuid, progress: &Progress) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        self.conn()
            .execute(
                "UPDATE processing_jobs SET processed_items = MAX(processed_items, ?1), failed_items = MAX(failed_items, ?2), progress_percentage = MAX(progress_percentage, ?3), current_item = ?4, updated_at = ?5 WHERE id = ?6 AND status = 'processing'",
                params![
                    progress.processed_items as i64,
                    progress.failed_items as i64,
                    progress.progress_percentage,
                    opt_text(progress.current_item.clone()),
                    now,
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_progress: {e}")))?;
        Ok(())
    }

    async fn update_item_status(
        &self,
        job_id: Uuid,
        item_id: &str,
        status: ItemStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        let started = matches!(status, ItemStatus::Processing) || status.is_terminal();
        let completed = status.is_terminal();

        self.conn()
            .execute(
                "INSERT INTO processing_job_items (job_id, item_id, status, result_data, error_message, created_at, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(job_id, item_id) DO UPDATE SET
                    status = excluded.status,
                    result_data = excluded.result_data,
                    error_message = excluded.error_message,
                    started_at = COALESCE(processing_job_items.started_at, excluded.started_at),
                    completed_at = excluded.completed_at",
                params![
                    job_id.to_string(),
                    item_id,
                    status.as_str(),
                    opt_json(result)?,
                    opt_text(error.map(str::to_string)),
                    now.as_str(),
                    opt_text(started.then(|| now.clone())),
                    opt_text(completed.then(|| now.clone())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_item_status: {e}")))?;
        Ok(())
    }

    // ── Maintenance ─────────────────────────────────────────────────

    async fn find_stale_processing_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM processing_jobs WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < ?1 ORDER BY started_at"
                ),
                params![ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_stale_processing_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_stale_processing_jobs: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn delete_expired_terminal_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let now = ts(now);
        self.conn()
            .execute(
                &format!(
                    "DELETE FROM processing_job_items WHERE job_id IN (SELECT id FROM processing_jobs WHERE status IN {TERMINAL_STATUSES} AND expires_at < ?1)"
                ),
                params![now.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_expired_terminal_jobs items: {e}")))?;

        let deleted = self
            .conn()
            .execute(
                &format!(
                    "DELETE FROM processing_jobs WHERE status IN {TERMINAL_STATUSES} AND expires_at < ?1"
                ),
                params![now.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_expired_terminal_jobs: {e}")))?;

        if deleted > 0 {
            debug!(deleted, "Expired jobs purged");
        }
        Ok(deleted as usize)
    }

    async fn status_counts(&self, kind: JobKind) -> Result<StatusCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM processing_jobs WHERE job_type = ?1 GROUP BY status",
                params![kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;

        let mut counts = StatusCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?
        {
            let status = text(&row, 0)?;
            let count = integer(&row, 1)?.max(0) as usize;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Queued) => counts.queued = count,
                Ok(JobStatus::Processing) => counts.processing = count,
                Ok(JobStatus::Completed) => counts.completed = count,
                Ok(JobStatus::Failed) => counts.failed = count,
                Ok(JobStatus::Cancelled) => counts.cancelled = count,
                Err(e) => debug!(error = %e, "Ignoring unknown status in counts"),
            }
        }
        Ok(counts)
    }
}
