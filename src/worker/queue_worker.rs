//! `QueueWorker`: wires consumers, admission, dispatcher, and sweeper into
//! one runnable service.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use super::admission::AdmissionController;
use super::consumer::{PollSettings, QueueConsumer};
use super::dispatcher::{DispatchSettings, Dispatcher};
use super::handler::HandlerRegistry;
use super::reporter::ProgressReporter;
use super::sweeper::Sweeper;
use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::jobs::model::JobKind;
use crate::store::JobStore;

pub struct QueueWorker {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
}

impl QueueWorker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            registry: Arc::new(registry),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Shutdown order: consumers stop polling and the sweeper stops, then
    /// in-flight jobs are awaited (multi-item jobs stop after their current
    /// item and go back on their queue), then the broker is closed.
    pub async fn run(self, shutdown: CancellationToken) {
        let admission = AdmissionController::new(self.config.max_concurrent);
        let tracker = TaskTracker::new();
        let dispatcher = Arc::new(Dispatcher::new(
            self.store.clone(),
            self.broker.clone(),
            self.registry.clone(),
            DispatchSettings::from(&self.config),
        ));

        info!(
            max_concurrent = admission.limit(),
            handlers = ?self.registry.kinds(),
            "Queue worker starting"
        );

        // Every kind gets a consumer so messages without a handler are
        // failed instead of piling up.
        let mut handles = Vec::with_capacity(JobKind::ALL.len() + 1);
        for kind in JobKind::ALL {
            let consumer = QueueConsumer::new(
                kind,
                self.broker.clone(),
                admission.clone(),
                dispatcher.clone(),
                tracker.clone(),
                PollSettings::from(&self.config),
            );
            handles.push(tokio::spawn(consumer.run(shutdown.clone())));
        }

        let sweeper = Sweeper::new(
            self.store.clone(),
            ProgressReporter::new(self.store.clone(), self.broker.clone()),
            &self.config,
        );
        handles.push(tokio::spawn(sweeper.run(shutdown.clone())));

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker loop panicked");
            }
        }

        tracker.close();
        info!(in_flight = tracker.len(), "Waiting for in-flight jobs");
        tracker.wait().await;
        admission.close();

        if let Err(e) = self.broker.close().await {
            error!(error = %e, "Failed to close broker");
        }
        info!("Queue worker stopped");
    }
}
