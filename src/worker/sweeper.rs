//! Timeout sweeper: fails jobs stuck in processing and purges expired ones.
//!
//! The first tick fires immediately, so jobs orphaned by a crashed worker are
//! picked up at startup once they pass the timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::reporter::ProgressReporter;
use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::store::JobStore;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub purged: usize,
}

pub struct Sweeper {
    store: Arc<dyn JobStore>,
    reporter: ProgressReporter,
    interval: Duration,
    processing_timeout: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<dyn JobStore>, reporter: ProgressReporter, config: &WorkerConfig) -> Self {
        Self {
            store,
            reporter,
            // `tokio::time::interval` panics on a zero period.
            interval: config.sweep_interval.max(MIN_INTERVAL),
            processing_timeout: config.processing_timeout,
        }
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.processing_timeout.as_secs(),
            "Sweeper started"
        );
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        info!("Sweeper stopped");
    }

    /// One pass of both duties. A failure in one does not skip the other.
    pub async fn sweep_once(&self) -> SweepReport {
        let report = SweepReport {
            timed_out: self.fail_timed_out().await,
            purged: self.purge_expired().await,
        };
        if report != SweepReport::default() {
            info!(timed_out = report.timed_out, purged = report.purged, "Sweep finished");
        }
        report
    }

    async fn fail_timed_out(&self) -> usize {
        let timeout = chrono::Duration::from_std(self.processing_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let stale = match self.store.find_stale_processing_jobs(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "Failed to scan for timed-out jobs");
                return 0;
            }
        };

        let mut timed_out = 0;
        for job in stale {
            let message = JobError::TimedOut {
                id: job.id,
                timeout: self.processing_timeout,
            }
            .to_string();
            match self.reporter.fail(job.id, &message).await {
                Ok(true) => {
                    warn!(
                        job_id = %job.id,
                        job_type = %job.kind,
                        elapsed_secs = job.elapsed().map(|d| d.as_secs()).unwrap_or(0),
                        "Job timed out"
                    );
                    timed_out += 1;
                }
                // Finished between the scan and the update.
                Ok(false) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to time out job"),
            }
        }
        timed_out
    }

    async fn purge_expired(&self) -> usize {
        match self.store.delete_expired_terminal_jobs(Utc::now()).await {
            Ok(purged) => purged,
            Err(e) => {
                error!(error = %e, "Failed to purge expired jobs");
                0
            }
        }
    }
}
