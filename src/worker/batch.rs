//! Sequential item processing for multi-item jobs.
//!
//! One item failing never fails the job: it is counted, recorded on the
//! item row, and the batch moves on. The job only fails if the handler
//! itself errors outside the per-item loop.

use std::future::Future;

use serde_json::json;
use tracing::{debug, warn};

use super::handler::{HandlerOutput, JobContext};
use crate::error::HandlerError;
use crate::jobs::model::{ItemStatus, Progress};

pub struct ItemBatch<'a> {
    ctx: &'a JobContext,
    items: Vec<String>,
}

impl<'a> ItemBatch<'a> {
    pub(crate) fn new(ctx: &'a JobContext, items: Vec<String>) -> Self {
        Self { ctx, items }
    }

    /// Run `process` over each item in order.
    ///
    /// Before each item the job's progress is reported. Between items the
    /// batch pauses for `item_delay`. If the worker starts shutting down, the
    /// batch stops before the next item and returns `HandlerError::Interrupted`.
    pub async fn run<F, Fut>(self, mut process: F) -> Result<HandlerOutput, HandlerError>
    where
        F: FnMut(String) -> Fut + Send,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
    {
        let ctx = self.ctx;
        let total = self.items.len();
        let mut processed = 0u32;
        let mut failed = 0u32;
        let mut results = Vec::with_capacity(total);

        for (index, item_id) in self.items.into_iter().enumerate() {
            if ctx.shutdown.is_cancelled() {
                debug!(job_id = %ctx.job_id, done = index, total, "Batch interrupted");
                return Err(HandlerError::Interrupted);
            }

            ctx.reporter
                .update_progress(
                    ctx.job_id,
                    Progress::new(processed, failed, percentage(index, total), Some(item_id.clone())),
                )
                .await;
            ctx.reporter
                .update_item_status(ctx.job_id, &item_id, ItemStatus::Processing, None, None)
                .await;

            let outcome = process(item_id.clone()).await;
            let done = percentage(index + 1, total);
            match outcome {
                Ok(result) => {
                    processed += 1;
                    ctx.reporter
                        .update_item_status(
                            ctx.job_id,
                            &item_id,
                            ItemStatus::Completed,
                            Some(&result),
                            None,
                        )
                        .await;
                    ctx.reporter
                        .publish_item_update(
                            ctx.job_id,
                            &item_id,
                            ItemStatus::Completed,
                            result.clone(),
                            done,
                        )
                        .await;
                    results.push(json!({"item_id": item_id, "success": true, "result": result}));
                }
                Err(e) => {
                    failed += 1;
                    let message = e.to_string();
                    warn!(job_id = %ctx.job_id, item_id = %item_id, error = %message, "Item failed");
                    ctx.reporter
                        .update_item_status(
                            ctx.job_id,
                            &item_id,
                            ItemStatus::Failed,
                            None,
                            Some(&message),
                        )
                        .await;
                    ctx.reporter
                        .publish_item_update(
                            ctx.job_id,
                            &item_id,
                            ItemStatus::Failed,
                            json!(message),
                            done,
                        )
                        .await;
                    results.push(json!({"item_id": item_id, "success": false, "error": message}));
                }
            }

            if index + 1 < total {
                tokio::select! {
                    _ = tokio::time::sleep(ctx.item_delay) => {}
                    _ = ctx.shutdown.cancelled() => {}
                }
            }
        }

        ctx.reporter
            .update_progress(ctx.job_id, Progress::new(processed, failed, 100.0, None))
            .await;

        Ok(HandlerOutput {
            result: serde_json::Value::Array(results),
            processed,
            failed,
        })
    }
}

fn percentage(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::jobs::model::{Job, JobKind, JobPriority};
    use crate::store::{JobStore, LibSqlJobStore};
    use crate::worker::reporter::ProgressReporter;

    async fn context(items: u32) -> (JobContext, Arc<LibSqlJobStore>) {
        let store = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let broker = Arc::new(MemoryBroker::new());
        let job = Job::new(
            JobKind::BulkAnalysis,
            JobPriority::Normal,
            json!({}),
            items,
            Duration::from_secs(60),
        );
        store.insert_job(&job).await.unwrap();
        store.mark_processing(job.id, Utc::now()).await.unwrap();

        let ctx = JobContext {
            job_id: job.id,
            kind: job.kind,
            priority: job.priority,
            payload: job.payload.clone(),
            retry_count: 0,
            reporter: ProgressReporter::new(store.clone(), broker),
            item_delay: Duration::from_millis(1),
            shutdown: CancellationToken::new(),
        };
        (ctx, store)
    }

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("resume-{i}")).collect()
    }

    #[tokio::test]
    async fn item_failure_is_isolated() {
        let (ctx, store) = context(3).await;

        let output = ctx
            .batch(ids(3))
            .run(|item| async move {
                if item == "resume-2" {
                    Err(HandlerError::transient("analysis service hiccup"))
                } else {
                    Ok(json!({"score": 70}))
                }
            })
            .await
            .unwrap();

        assert_eq!(output.processed, 2);
        assert_eq!(output.failed, 1);
        let results = output.result.as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[1]["success"], false);

        let items = store.list_items(ctx.job_id).await.unwrap();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.status.is_terminal()));
        assert_eq!(items[1].status, ItemStatus::Failed);

        let job = store.get_job(ctx.job_id).await.unwrap().unwrap();
        assert_eq!(job.progress_percentage, 100.0);
        assert_eq!(job.processed_items, 2);
        assert_eq!(job.failed_items, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_before_next_item() {
        let (ctx, store) = context(3).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let shutdown = ctx.shutdown.clone();

        let result = ctx
            .batch(ids(3))
            .run(|_item| {
                let calls = calls.clone();
                let shutdown = shutdown.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    shutdown.cancel();
                    Ok(json!({}))
                }
            })
            .await;

        assert_eq!(result, Err(HandlerError::Interrupted));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let items = store.list_items(ctx.job_id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn empty_batch_completes() {
        let (ctx, _store) = context(0).await;
        let output = ctx
            .batch(Vec::new())
            .run(|_item| async { Ok(json!({})) })
            .await
            .unwrap();
        assert_eq!(output.processed, 0);
        assert_eq!(output.result, json!([]));
    }
}
