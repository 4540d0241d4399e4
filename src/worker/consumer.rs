//! Per-kind queue consumer loop.
//!
//! Each cycle takes an admission permit, then polls the high topic and, only
//! if that came back empty, the normal topic. A popped message is handed to
//! a tracked task together with the permit.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::admission::AdmissionController;
use super::dispatcher::{Dispatcher, Outcome};
use crate::broker::{Broker, queue_topic};
use crate::config::WorkerConfig;
use crate::error::BrokerError;
use crate::jobs::model::{JobKind, JobPriority};

/// Poll order within one cycle.
const PRIORITY_ORDER: [JobPriority; 2] = [JobPriority::High, JobPriority::Normal];

/// A message taken off one of a kind's topics.
#[derive(Debug, Clone, PartialEq)]
pub struct Polled {
    pub priority: JobPriority,
    pub topic: String,
    pub payload: String,
}

/// Pop at most one message for `kind`, preferring the high-priority topic.
pub async fn poll_by_priority(
    broker: &dyn Broker,
    kind: JobKind,
    timeout: Duration,
) -> Result<Option<Polled>, BrokerError> {
    for priority in PRIORITY_ORDER {
        let topic = queue_topic(kind, priority);
        if let Some(payload) = broker.pop(&topic, timeout).await? {
            return Ok(Some(Polled {
                priority,
                topic,
                payload,
            }));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub poll_timeout: Duration,
    pub idle_backoff: Duration,
    pub error_backoff: Duration,
}

impl From<&WorkerConfig> for PollSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout,
            idle_backoff: config.idle_backoff,
            error_backoff: config.error_backoff,
        }
    }
}

pub struct QueueConsumer {
    kind: JobKind,
    broker: Arc<dyn Broker>,
    admission: AdmissionController,
    dispatcher: Arc<Dispatcher>,
    tracker: TaskTracker,
    settings: PollSettings,
}

impl QueueConsumer {
    pub fn new(
        kind: JobKind,
        broker: Arc<dyn Broker>,
        admission: AdmissionController,
        dispatcher: Arc<Dispatcher>,
        tracker: TaskTracker,
        settings: PollSettings,
    ) -> Self {
        Self {
            kind,
            broker,
            admission,
            dispatcher,
            tracker,
            settings,
        }
    }

    /// Run until `shutdown` is cancelled. In-flight jobs keep running on the
    /// tracker after this returns.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(job_type = %self.kind, "Queue consumer started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = self.admission.acquire() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };
            if shutdown.is_cancelled() {
                break;
            }

            // Not raced against shutdown: abandoning a blocking pop after the
            // server has answered would lose the message.
            let polled =
                poll_by_priority(self.broker.as_ref(), self.kind, self.settings.poll_timeout).await;

            match polled {
                Ok(Some(polled)) => {
                    debug!(job_type = %self.kind, priority = %polled.priority, "Message received");
                    let dispatcher = self.dispatcher.clone();
                    let shutdown = shutdown.clone();
                    self.tracker.spawn(async move {
                        let outcome = dispatcher.dispatch(&polled.payload, &shutdown).await;
                        drop(permit);
                        match outcome {
                            Outcome::Retry { message, delay } => {
                                dispatcher
                                    .retry_later(&polled.topic, message, delay, &shutdown)
                                    .await;
                            }
                            Outcome::Requeue { message, delay } => {
                                dispatcher
                                    .reenqueue(&polled.topic, message, delay, &shutdown)
                                    .await;
                            }
                            _ => {}
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    sleep_or_cancel(self.settings.idle_backoff, &shutdown).await;
                }
                Err(e) => {
                    drop(permit);
                    error!(job_type = %self.kind, error = %e, "Queue poll failed");
                    sleep_or_cancel(self.settings.error_backoff, &shutdown).await;
                }
            }
        }

        info!(job_type = %self.kind, "Queue consumer stopped");
    }
}

async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.cancelled() => {}
    }
}
