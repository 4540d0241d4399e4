//! Producer side: create, enqueue, and cancel jobs; report queue depth.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::model::{Job, JobKind, JobPriority};
use crate::broker::{Broker, queue_topic};
use crate::error::{JobError, Result};
use crate::store::{JobStore, StatusCounts};
use crate::worker::reporter::ProgressReporter;

/// Snapshot of one job kind's queues and job counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub kind: JobKind,
    pub high_depth: usize,
    pub normal_depth: usize,
    pub jobs: StatusCounts,
}

pub struct JobProducer {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    reporter: ProgressReporter,
    retention: Duration,
}

impl JobProducer {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>, retention: Duration) -> Self {
        let reporter = ProgressReporter::new(store.clone(), broker.clone());
        Self {
            store,
            broker,
            reporter,
            retention,
        }
    }

    /// Persist a queued job with its item rows, then push its message.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        priority: JobPriority,
        payload: serde_json::Value,
        item_ids: Vec<String>,
    ) -> Result<Uuid> {
        let total = u32::try_from(item_ids.len()).unwrap_or(u32::MAX);
        let job = Job::new(kind, priority, payload, total, self.retention);

        self.store.insert_job(&job).await?;
        if !item_ids.is_empty() {
            self.store.insert_items(job.id, &item_ids).await?;
        }

        let raw = job.to_message().encode()?;
        self.broker.push(&queue_topic(kind, priority), &raw).await?;

        info!(job_id = %job.id, job_type = %kind, priority = %priority, items = total, "Job enqueued");
        Ok(job.id)
    }

    /// Cancel a queued or processing job. Returns false if it had already
    /// finished. A running handler is not interrupted, but its result is
    /// discarded.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        if self.store.get_job(job_id).await?.is_none() {
            return Err(JobError::NotFound { id: job_id }.into());
        }
        let cancelled = self.store.cancel_job(job_id).await?;
        if cancelled {
            self.reporter.cancelled(job_id).await;
        }
        Ok(cancelled)
    }

    pub async fn queue_stats(&self, kind: JobKind) -> Result<QueueStats> {
        Ok(QueueStats {
            kind,
            high_depth: self
                .broker
                .depth(&queue_topic(kind, JobPriority::High))
                .await?,
            normal_depth: self
                .broker
                .depth(&queue_topic(kind, JobPriority::Normal))
                .await?,
            jobs: self.store.status_counts(kind).await?,
        })
    }
}
