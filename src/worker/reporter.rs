//! Progress reporter: persists job state and publishes job updates.
//!
//! Progress and item writes are best-effort and only logged on failure.
//! Terminal writes return their error so the caller can decide, and an
//! event is only published when the conditional update actually applied.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, updates_channel};
use crate::error::DatabaseError;
use crate::jobs::events::JobEvent;
use crate::jobs::model::{ItemStatus, Progress};
use crate::store::JobStore;

#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Persist counters and publish a `progress_update`.
    pub async fn update_progress(&self, job_id: Uuid, progress: Progress) {
        if let Err(e) = self.store.update_progress(job_id, &progress).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist progress");
        }
        self.publish(JobEvent::progress(job_id, &progress)).await;
    }

    /// Persist one item's status.
    pub async fn update_item_status(
        &self,
        job_id: Uuid,
        item_id: &str,
        status: ItemStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .update_item_status(job_id, item_id, status, result, error)
            .await
        {
            warn!(job_id = %job_id, item_id, error = %e, "Failed to persist item status");
        }
    }

    /// Publish the outcome of one item as a `progress_update`.
    pub async fn publish_item_update(
        &self,
        job_id: Uuid,
        item_id: &str,
        status: ItemStatus,
        detail: serde_json::Value,
        progress_percentage: f64,
    ) {
        self.publish(JobEvent::item_finished(
            job_id,
            item_id,
            status,
            detail,
            progress_percentage,
        ))
        .await;
    }

    /// processing -> completed, then publish `job_completed`.
    /// Returns false when the job had already left processing.
    pub async fn complete(
        &self,
        job_id: Uuid,
        result: serde_json::Value,
        processed: u32,
        failed: u32,
    ) -> Result<bool, DatabaseError> {
        let applied = self
            .store
            .complete_job(job_id, &result, processed, failed)
            .await?;
        if applied {
            info!(job_id = %job_id, processed, failed, "Job completed");
            self.publish(JobEvent::completed(job_id, &result, processed, failed))
                .await;
        } else {
            debug!(job_id = %job_id, "Completion skipped, job no longer processing");
        }
        Ok(applied)
    }

    /// processing -> failed, then publish `job_failed`.
    /// Returns false when the job had already left processing.
    pub async fn fail(&self, job_id: Uuid, error_message: &str) -> Result<bool, DatabaseError> {
        let applied = self.store.fail_job(job_id, error_message).await?;
        if applied {
            error!(job_id = %job_id, error = %error_message, "Job failed");
            self.publish(JobEvent::failed(job_id, error_message)).await;
        } else {
            debug!(job_id = %job_id, "Failure skipped, job no longer processing");
        }
        Ok(applied)
    }

    /// Publish `job_cancelled` for a job already marked cancelled.
    pub async fn cancelled(&self, job_id: Uuid) {
        info!(job_id = %job_id, "Job cancelled");
        self.publish(JobEvent::cancelled(job_id)).await;
    }

    /// Best-effort publish; failures never affect job state.
    async fn publish(&self, event: JobEvent) {
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "Failed to encode job event");
                return;
            }
        };
        if let Err(e) = self
            .broker
            .publish(&updates_channel(event.job_id), &payload)
            .await
        {
            warn!(job_id = %event.job_id, error = %e, "Failed to publish job event");
        }
    }
}
