//! Property: however jobs are spread across kinds and priorities, and
//! however long handlers take, the worker never runs more than
//! `max_concurrent` of them at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use analysis_worker::broker::MemoryBroker;
use analysis_worker::config::WorkerConfig;
use analysis_worker::error::HandlerError;
use analysis_worker::jobs::{JobKind, JobPriority, JobProducer};
use analysis_worker::store::{JobStore, LibSqlJobStore};
use analysis_worker::worker::{HandlerOutput, HandlerRegistry, JobContext, JobHandler, QueueWorker};

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl JobHandler for Gauge {
    async fn handle(&self, ctx: &JobContext) -> Result<HandlerOutput, HandlerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay_ms = ctx.payload["delay_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(HandlerOutput {
            result: json!({}),
            processed: 0,
            failed: 0,
        })
    }
}

fn job_spec() -> impl Strategy<Value = (usize, bool, u64)> {
    (0..JobKind::ALL.len(), any::<bool>(), 0u64..15)
}

async fn run_jobs(max_concurrent: usize, jobs: Vec<(usize, bool, u64)>) -> (usize, usize) {
    let config = WorkerConfig {
        max_concurrent,
        poll_timeout: Duration::from_millis(10),
        idle_backoff: Duration::from_millis(2),
        ..WorkerConfig::default()
    };
    let store = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
    let broker = Arc::new(MemoryBroker::new());
    let producer = JobProducer::new(store.clone(), broker.clone(), config.retention);

    let gauge = Arc::new(Gauge::default());
    let mut registry = HandlerRegistry::new();
    for kind in JobKind::ALL {
        registry.register(kind, gauge.clone());
    }

    for (kind, high, delay_ms) in &jobs {
        let priority = if *high { JobPriority::High } else { JobPriority::Normal };
        producer
            .enqueue(JobKind::ALL[*kind], priority, json!({"delay_ms": delay_ms}), Vec::new())
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let worker = QueueWorker::new(config, store.clone(), broker, registry);
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while gauge.finished.load(Ordering::SeqCst) < jobs.len() {
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    handle.await.unwrap();

    let counts = store.status_counts(JobKind::ALL[0]).await.unwrap();
    assert_eq!(counts.processing, 0);

    (gauge.peak.load(Ordering::SeqCst), gauge.finished.load(Ordering::SeqCst))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 12,
        ..ProptestConfig::default()
    })]

    #[test]
    fn in_flight_never_exceeds_limit(
        max_concurrent in 1usize..4,
        jobs in prop::collection::vec(job_spec(), 1..12),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let expected = jobs.len();
        let (peak, finished) = runtime.block_on(run_jobs(max_concurrent, jobs));

        prop_assert!(peak <= max_concurrent, "peak {} over limit {}", peak, max_concurrent);
        prop_assert!(peak >= 1);
        prop_assert_eq!(finished, expected);
    }
}
