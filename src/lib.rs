//! Analysis worker: consumes AI-analysis jobs from priority queues and
//! tracks their progress.

pub mod analysis;
pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod store;
pub mod worker;

pub use config::{AnalysisConfig, WorkerConfig};
pub use error::{Error, Result};
pub use worker::QueueWorker;
