//! Events published on `job_updates:{job_id}` channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::model::{ItemStatus, Progress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    ProgressUpdate,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

/// Envelope for every job update: `{job_id, type, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: JobEventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    fn new(job_id: Uuid, event_type: JobEventType, data: serde_json::Value) -> Self {
        Self {
            job_id,
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn progress(job_id: Uuid, progress: &Progress) -> Self {
        Self::new(
            job_id,
            JobEventType::ProgressUpdate,
            json!({
                "processed_items": progress.processed_items,
                "failed_items": progress.failed_items,
                "progress_percentage": progress.progress_percentage,
                "current_item": progress.current_item,
            }),
        )
    }

    /// Outcome of one item in a multi-item job.
    pub fn item_finished(
        job_id: Uuid,
        item_id: &str,
        status: ItemStatus,
        detail: serde_json::Value,
        progress_percentage: f64,
    ) -> Self {
        let detail_key = match status {
            ItemStatus::Failed => "error",
            _ => "result",
        };
        Self::new(
            job_id,
            JobEventType::ProgressUpdate,
            json!({
                "item_id": item_id,
                "status": status.as_str(),
                detail_key: detail,
                "progress_percentage": progress_percentage,
            }),
        )
    }

    pub fn completed(job_id: Uuid, result: &serde_json::Value, processed: u32, failed: u32) -> Self {
        Self::new(
            job_id,
            JobEventType::JobCompleted,
            json!({
                "status": "completed",
                "total_processed": processed,
                "total_failed": failed,
                "results": result,
            }),
        )
    }

    pub fn failed(job_id: Uuid, error: &str) -> Self {
        Self::new(
            job_id,
            JobEventType::JobFailed,
            json!({
                "status": "failed",
                "error_message": error,
            }),
        )
    }

    pub fn cancelled(job_id: Uuid) -> Self {
        Self::new(
            job_id,
            JobEventType::JobCancelled,
            json!({ "status": "cancelled" }),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
