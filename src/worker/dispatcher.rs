//! Dispatcher: runs one popped message through its handler and applies the
//! outcome to the job's state.
//!
//! Never returns an error. Every failure is either recorded on the job row
//! or logged, and the caller only learns whether the message must go back
//! on its topic.
//!
//! A job waiting out a retry delay stays `processing` until the moment its
//! message is pushed again, so a worker that dies during the wait leaves a
//! row the sweeper will time out.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{HandlerRegistry, JobContext, JobHandler};
use super::reporter::ProgressReporter;
use super::retry::{RetryDecision, RetryPolicy};
use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::error::{HandlerError, JobError};
use crate::jobs::model::{Job, JobKind, QueueMessage, salvage_job_id};
use crate::store::JobStore;

/// Result of dispatching one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Failed,
    /// The job was already terminal, cancelled, or owned by someone else.
    Skipped,
    /// The message could not be tied to any job.
    Dropped,
    /// Push `message` back on its topic after `delay`. The row is still
    /// queued (or was never claimed).
    Requeue {
        message: QueueMessage,
        delay: Duration,
    },
    /// Run the job again after `delay`. The row is still processing and is
    /// returned to queued right before the push.
    Retry {
        message: QueueMessage,
        delay: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub retry: RetryPolicy,
    pub item_delay: Duration,
    /// Expiry given to rows recreated from a message.
    pub retention: Duration,
    /// Delay before re-pushing a message the store could not accept.
    pub error_backoff: Duration,
}

impl From<&WorkerConfig> for DispatchSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            item_delay: config.item_delay,
            retention: config.retention,
            error_backoff: config.error_backoff,
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    reporter: ProgressReporter,
    registry: Arc<HandlerRegistry>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        let reporter = ProgressReporter::new(store.clone(), broker.clone());
        Self {
            store,
            broker,
            reporter,
            registry,
            settings,
        }
    }

    /// Decode and run one raw message.
    pub async fn dispatch(&self, raw: &str, shutdown: &CancellationToken) -> Outcome {
        match QueueMessage::decode(raw) {
            Ok(message) => self.dispatch_message(message, shutdown).await,
            Err(e) => match salvage_job_id(raw) {
                Some(job_id) => {
                    error!(job_id = %job_id, error = %e, "Malformed queue message");
                    self.fail_queued(job_id, &e.to_string()).await;
                    Outcome::Failed
                }
                None => {
                    error!(error = %e, raw = %truncate(raw, 200), "Dropping malformed message with no job id");
                    Outcome::Dropped
                }
            },
        }
    }

    pub async fn dispatch_message(
        &self,
        message: QueueMessage,
        shutdown: &CancellationToken,
    ) -> Outcome {
        let job_id = message.job_id;

        match self.store.get_job(job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                info!(job_id = %job_id, status = %job.status, "Skipping finished job");
                return Outcome::Skipped;
            }
            Ok(Some(_)) => {}
            Ok(None) => match Job::from_message(&message, self.settings.retention) {
                Ok(job) => {
                    warn!(job_id = %job_id, "Job row missing, recreating from message");
                    if let Err(e) = self.store.insert_job(&job).await {
                        error!(job_id = %job_id, error = %e, "Failed to recreate job row");
                        return self.requeue_later(message);
                    }
                }
                Err(e) => {
                    error!(
                        job_id = %job_id,
                        job_type = %message.job_type,
                        retry_count = message.retry_count,
                        data = %truncate(&message.data.to_string(), 200),
                        error = %e,
                        "Dropping message with no stored job"
                    );
                    return Outcome::Dropped;
                }
            },
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Job store unavailable");
                return self.requeue_later(message);
            }
        }

        match self.store.mark_processing(job_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %job_id, "Job is not queued, skipping");
                return Outcome::Skipped;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to mark job processing");
                return self.requeue_later(message);
            }
        }

        let (kind, handler) = match self.resolve(&message) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.finish_failed(job_id, &e.to_string()).await;
                return Outcome::Failed;
            }
        };

        info!(
            job_id = %job_id,
            job_type = %kind,
            retry_count = message.retry_count,
            "Processing job"
        );

        let ctx = JobContext {
            job_id,
            kind,
            priority: message.priority,
            payload: message.data.clone(),
            retry_count: message.retry_count,
            reporter: self.reporter.clone(),
            item_delay: self.settings.item_delay,
            shutdown: shutdown.clone(),
        };

        let result = AssertUnwindSafe(handler.handle(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::permanent(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match result {
            Ok(output) => {
                match self
                    .reporter
                    .complete(job_id, output.result, output.processed, output.failed)
                    .await
                {
                    Ok(true) => Outcome::Completed,
                    Ok(false) => Outcome::Skipped,
                    Err(e) => {
                        // Row stays processing; the sweeper will time it out.
                        error!(job_id = %job_id, error = %e, "Failed to record job completion");
                        Outcome::Completed
                    }
                }
            }
            Err(HandlerError::Interrupted) => {
                info!(job_id = %job_id, "Returning interrupted job to its queue");
                Outcome::Retry {
                    message,
                    delay: Duration::ZERO,
                }
            }
            Err(e) => self.handle_failure(message, e).await,
        }
    }

    /// Apply the retry policy to a failed attempt.
    async fn handle_failure(&self, message: QueueMessage, error: HandlerError) -> Outcome {
        let job_id = message.job_id;
        match self.settings.retry.decide(message.retry_count, &error) {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    job_id = %job_id,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    error = %error,
                    "Job failed, scheduling retry"
                );
                Outcome::Retry {
                    message: message.with_retry_count(attempt),
                    delay,
                }
            }
            RetryDecision::GiveUp => {
                self.finish_failed(job_id, &error.to_string()).await;
                Outcome::Failed
            }
        }
    }

    /// Wait out `delay` and push `message` back onto `topic`. Shutdown cuts
    /// the wait short so the message is not lost. If the push fails the job
    /// is marked failed.
    pub async fn reenqueue(
        &self,
        topic: &str,
        message: QueueMessage,
        delay: Duration,
        shutdown: &CancellationToken,
    ) {
        wait_or_cancel(message.job_id, delay, shutdown).await;

        let pushed = match message.encode() {
            Ok(raw) => self
                .broker
                .push(topic, &raw)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match pushed {
            Ok(()) => debug!(job_id = %message.job_id, topic, "Job re-enqueued"),
            Err(reason) => {
                error!(job_id = %message.job_id, topic, error = %reason, "Failed to re-enqueue job");
                self.fail_queued(message.job_id, &format!("Could not re-enqueue job: {reason}"))
                    .await;
            }
        }
    }

    /// Wait out `delay`, move the row from processing back to queued, then
    /// push `message`. Nothing is pushed if the job left processing in the
    /// meantime (cancelled or timed out). If the row cannot be updated it is
    /// left processing for the sweeper.
    pub async fn retry_later(
        &self,
        topic: &str,
        message: QueueMessage,
        delay: Duration,
        shutdown: &CancellationToken,
    ) {
        wait_or_cancel(message.job_id, delay, shutdown).await;

        let job_id = message.job_id;
        match self.store.requeue(job_id, message.retry_count).await {
            Ok(true) => self.reenqueue(topic, message, Duration::ZERO, shutdown).await,
            Ok(false) => {
                debug!(job_id = %job_id, "Job left processing before retry, not requeueing");
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to return job to queued, leaving it to the sweeper");
            }
        }
    }

    fn resolve(&self, message: &QueueMessage) -> Result<(JobKind, Arc<dyn JobHandler>), JobError> {
        let kind = message.kind()?;
        let handler = self
            .registry
            .get(kind)
            .ok_or_else(|| JobError::NoHandler(kind.to_string()))?;
        Ok((kind, handler))
    }

    fn requeue_later(&self, message: QueueMessage) -> Outcome {
        Outcome::Requeue {
            message,
            delay: self.settings.error_backoff,
        }
    }

    async fn finish_failed(&self, job_id: Uuid, error_message: &str) {
        if let Err(e) = self.reporter.fail(job_id, error_message).await {
            error!(job_id = %job_id, error = %e, "Failed to record job failure");
        }
    }

    /// Fail a job that is still queued, going through processing so the
    /// state machine is respected.
    async fn fail_queued(&self, job_id: Uuid, error_message: &str) {
        if let Err(e) = self.store.mark_processing(job_id, Utc::now()).await {
            error!(job_id = %job_id, error = %e, "Failed to mark job processing");
        }
        self.finish_failed(job_id, error_message).await;
    }
}

/// Sleep for `delay`, cut short by shutdown so the message is not lost.
async fn wait_or_cancel(job_id: Uuid, delay: Duration, shutdown: &CancellationToken) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.cancelled() => {
            debug!(job_id = %job_id, "Shutdown during backoff, re-enqueueing now");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::broker::{MemoryBroker, queue_topic, updates_channel};
    use crate::jobs::events::{JobEvent, JobEventType};
    use crate::jobs::model::{JobPriority, JobStatus};
    use crate::store::LibSqlJobStore;
    use crate::worker::handler::HandlerOutput;
    use crate::worker::sweeper::Sweeper;

    /// Returns the same result on every call.
    struct Scripted {
        result: Result<(), HandlerError>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(result: Result<(), HandlerError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        async fn handle(&self, _ctx: &JobContext) -> Result<HandlerOutput, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().map(|()| HandlerOutput {
                result: json!({"ok": true}),
                processed: 1,
                failed: 0,
            })
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn handle(&self, _ctx: &JobContext) -> Result<HandlerOutput, HandlerError> {
            panic!("bad state");
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<LibSqlJobStore>,
        broker: Arc<MemoryBroker>,
    }

    async fn harness(handler: Arc<dyn JobHandler>) -> Harness {
        let store = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let broker = Arc::new(MemoryBroker::recording());
        let mut registry = HandlerRegistry::new();
        registry.register(JobKind::BulkAnalysis, handler);
        let settings = DispatchSettings {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(10),
                ..Default::default()
            },
            item_delay: Duration::ZERO,
            retention: Duration::from_secs(3600),
            error_backoff: Duration::from_millis(5),
        };
        let dispatcher = Dispatcher::new(store.clone(), broker.clone(), Arc::new(registry), settings);
        Harness {
            dispatcher,
            store,
            broker,
        }
    }

    async fn queued_job(h: &Harness, kind: JobKind) -> Job {
        let job = Job::new(kind, JobPriority::Normal, json!({}), 1, Duration::from_secs(3600));
        h.store.insert_job(&job).await.unwrap();
        job
    }

    fn events(h: &Harness, job_id: Uuid) -> Vec<JobEventType> {
        h.broker
            .published(&updates_channel(job_id))
            .iter()
            .map(|raw| serde_json::from_str::<JobEvent>(raw).unwrap().event_type)
            .collect()
    }

    #[tokio::test]
    async fn success_completes_job() {
        let h = harness(Scripted::new(Ok(()))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;

        let outcome = h
            .dispatcher
            .dispatch_message(job.to_message(), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Completed);
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result_data, Some(json!({"ok": true})));
        assert!(stored.started_at.is_some());
        assert_eq!(events(&h, job.id), vec![JobEventType::JobCompleted]);
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_backoff() {
        let h = harness(Scripted::new(Err(HandlerError::transient("503")))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;

        let outcome = h
            .dispatcher
            .dispatch_message(job.to_message(), &CancellationToken::new())
            .await;

        let Outcome::Retry { message, delay } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(message.retry_count, 1);
        assert_eq!(delay, Duration::from_millis(10));

        // Still claimed while the delay runs.
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.retry_count, 0);
        assert!(events(&h, job.id).is_empty());

        let topic = queue_topic(JobKind::BulkAnalysis, JobPriority::Normal);
        h.dispatcher
            .retry_later(&topic, message, delay, &CancellationToken::new())
            .await;

        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 1);
        let raw = h.broker.pop(&topic, Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(QueueMessage::decode(&raw).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn lost_retry_is_recovered_by_sweeper() {
        let h = harness(Scripted::new(Err(HandlerError::transient("503")))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;

        let outcome = h
            .dispatcher
            .dispatch_message(job.to_message(), &CancellationToken::new())
            .await;
        // The worker dies before the retry delay ends: the outcome is dropped.
        assert!(matches!(outcome, Outcome::Retry { .. }));
        drop(outcome);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let config = WorkerConfig {
            processing_timeout: Duration::ZERO,
            ..WorkerConfig::default()
        };
        let sweeper = Sweeper::new(
            h.store.clone(),
            ProgressReporter::new(h.store.clone(), h.broker.clone()),
            &config,
        );
        assert_eq!(sweeper.sweep_once().await.timed_out, 1);

        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(events(&h, job.id), vec![JobEventType::JobFailed]);
    }

    #[tokio::test]
    async fn retry_skipped_when_job_left_processing() {
        let h = harness(Scripted::new(Err(HandlerError::transient("503")))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;

        let outcome = h
            .dispatcher
            .dispatch_message(job.to_message(), &CancellationToken::new())
            .await;
        let Outcome::Retry { message, delay } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        h.store.cancel_job(job.id).await.unwrap();

        let topic = queue_topic(JobKind::BulkAnalysis, JobPriority::Normal);
        h.dispatcher
            .retry_later(&topic, message, delay, &CancellationToken::new())
            .await;

        assert_eq!(h.broker.depth(&topic).await.unwrap(), 0);
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_once() {
        let h = harness(Scripted::new(Err(HandlerError::transient("503")))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;
        h.store.mark_processing(job.id, Utc::now()).await.unwrap();
        h.store.requeue(job.id, 3).await.unwrap();

        let message = job.to_message().with_retry_count(3);
        let outcome = h
            .dispatcher
            .dispatch_message(message, &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Failed);
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.error_message.as_deref(), Some("503"));
        assert_eq!(events(&h, job.id), vec![JobEventType::JobFailed]);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let handler = Scripted::new(Err(HandlerError::permanent("resume not found")));
        let h = harness(handler.clone()).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;

        let outcome = h
            .dispatcher
            .dispatch_message(job.to_message(), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn unknown_job_type_fails_permanently() {
        let h = harness(Scripted::new(Ok(()))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;
        let mut message = job.to_message();
        message.job_type = "resume_rewrite".to_string();

        let outcome = h
            .dispatcher
            .dispatch_message(message, &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Failed);
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("Unknown job type: resume_rewrite")
        );
    }

    #[tokio::test]
    async fn missing_handler_fails_permanently() {
        let h = harness(Scripted::new(Ok(()))).await;
        let job = queued_job(&h, JobKind::SkillGapBatch).await;

        let outcome = h
            .dispatcher
            .dispatch_message(job.to_message(), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Failed);
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("No handler"));
    }

    #[tokio::test]
    async fn finished_jobs_are_skipped() {
        let handler = Scripted::new(Ok(()));
        let h = harness(handler.clone()).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;
        h.store.cancel_job(job.id).await.unwrap();

        let outcome = h
            .dispatcher
            .dispatch_message(job.to_message(), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_row_is_recreated() {
        let h = harness(Scripted::new(Ok(()))).await;
        let message = QueueMessage {
            job_id: Uuid::new_v4(),
            job_type: "bulk_analysis".to_string(),
            data: json!({"ResumeIds": []}),
            retry_count: 0,
            priority: JobPriority::High,
        };

        let outcome = h
            .dispatcher
            .dispatch_message(message.clone(), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Completed);
        let stored = h.store.get_job(message.job_id).await.unwrap().unwrap();
        assert_eq!(stored.priority, JobPriority::High);
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn malformed_messages() {
        let h = harness(Scripted::new(Ok(()))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;

        let raw = format!(r#"{{"job_id":"{}","retry_count":"x"}}"#, job.id);
        let token = CancellationToken::new();
        assert_eq!(h.dispatcher.dispatch(&raw, &token).await, Outcome::Failed);
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);

        assert_eq!(h.dispatcher.dispatch("}{", &token).await, Outcome::Dropped);
    }

    #[tokio::test]
    async fn unknown_type_without_row_is_dropped() {
        let handler = Scripted::new(Ok(()));
        let h = harness(handler.clone()).await;
        let message = QueueMessage {
            job_id: Uuid::new_v4(),
            job_type: "resume_rewrite".to_string(),
            data: json!({}),
            retry_count: 0,
            priority: JobPriority::Normal,
        };

        let outcome = h
            .dispatcher
            .dispatch_message(message.clone(), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.get_job(message.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn panicking_handler_fails_job() {
        let h = harness(Arc::new(Panics)).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;

        let outcome = h
            .dispatcher
            .dispatch_message(job.to_message(), &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Failed);
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("handler panicked: bad state"));
    }

    #[tokio::test]
    async fn interrupted_job_keeps_retry_budget() {
        let h = harness(Scripted::new(Err(HandlerError::Interrupted))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;

        let outcome = h
            .dispatcher
            .dispatch_message(job.to_message(), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            Outcome::Retry {
                message: job.to_message(),
                delay: Duration::ZERO
            }
        );
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn reenqueue_pushes_to_topic() {
        let h = harness(Scripted::new(Ok(()))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;
        let topic = queue_topic(JobKind::BulkAnalysis, JobPriority::Normal);

        h.dispatcher
            .reenqueue(
                &topic,
                job.to_message().with_retry_count(2),
                Duration::from_millis(1),
                &CancellationToken::new(),
            )
            .await;

        let raw = h.broker.pop(&topic, Duration::from_millis(10)).await.unwrap().unwrap();
        let message = QueueMessage::decode(&raw).unwrap();
        assert_eq!(message.job_id, job.id);
        assert_eq!(message.retry_count, 2);
    }

    #[tokio::test]
    async fn failed_reenqueue_fails_job() {
        let h = harness(Scripted::new(Ok(()))).await;
        let job = queued_job(&h, JobKind::BulkAnalysis).await;
        h.broker.close().await.unwrap();

        h.dispatcher
            .reenqueue("queue:bulk_analysis:normal", job.to_message(), Duration::ZERO, &CancellationToken::new())
            .await;

        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().starts_with("Could not re-enqueue job"));
    }
}
