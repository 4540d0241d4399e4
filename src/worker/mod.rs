//! Worker runtime: consumes job messages and drives them to completion.
//!
//! Core components:
//! - `admission`: Global concurrency limit (semaphore permits)
//! - `consumer`: Per-kind poll loop (high before normal)
//! - `dispatcher`: Runs a handler and applies the outcome to job state
//! - `retry`: Retry budget and backoff
//! - `reporter`: Progress persistence and pub/sub updates
//! - `batch`: Per-item loop for multi-item jobs
//! - `sweeper`: Processing timeouts and expired-job purge
//! - `queue_worker`: Wires everything into one service

pub mod admission;
pub mod batch;
pub mod consumer;
pub mod dispatcher;
pub mod handler;
pub mod queue_worker;
pub mod reporter;
pub mod retry;
pub mod sweeper;

pub use admission::{AdmissionController, AdmissionPermit};
pub use dispatcher::{Dispatcher, Outcome};
pub use handler::{HandlerOutput, HandlerRegistry, JobContext, JobHandler};
pub use queue_worker::QueueWorker;
pub use reporter::ProgressReporter;
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use sweeper::{SweepReport, Sweeper};
