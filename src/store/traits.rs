//! `JobStore` trait: the async interface for job persistence.
//!
//! Every status-changing write is conditional on the row's current status
//! and reports whether it applied, so concurrent writers (the dispatcher,
//! the sweeper, a cancelling producer) cannot move a job out of a terminal
//! state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{ItemStatus, Job, JobItem, JobKind, Progress};

/// Job counts per status for one job kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job row.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Insert pending item rows for a job. Existing items are left alone.
    async fn insert_items(&self, job_id: Uuid, item_ids: &[String]) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// All items of a job, in insertion order.
    async fn list_items(&self, job_id: Uuid) -> Result<Vec<JobItem>, DatabaseError>;

    // ── Status transitions ──────────────────────────────────────────

    /// queued -> processing. Sets `started_at` on the first entry only.
    async fn mark_processing(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// processing -> queued with a new retry count.
    async fn requeue(&self, id: Uuid, retry_count: u32) -> Result<bool, DatabaseError>;

    /// processing -> completed, storing the result and final counters.
    async fn complete_job(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        processed: u32,
        failed: u32,
    ) -> Result<bool, DatabaseError>;

    /// processing -> failed, storing the error message.
    async fn fail_job(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError>;

    /// queued or processing -> cancelled.
    async fn cancel_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Progress ────────────────────────────────────────────────────

    /// Record progress counters. Counters never move backwards.
    async fn update_progress(&self, id: Uuid, progress: &Progress) -> Result<(), DatabaseError>;

    /// Upsert one item's status.
    async fn update_item_status(
        &self,
        job_id: Uuid,
        item_id: &str,
        status: ItemStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    // ── Maintenance ─────────────────────────────────────────────────

    /// Jobs still processing that started before `cutoff`.
    async fn find_stale_processing_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Delete terminal jobs (and their items) whose `expires_at` is before `now`.
    async fn delete_expired_terminal_jobs(&self, now: DateTime<Utc>)
    -> Result<usize, DatabaseError>;

    /// Per-status job counts for one kind.
    async fn status_counts(&self, kind: JobKind) -> Result<StatusCounts, DatabaseError>;
}
