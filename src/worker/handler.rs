//! Job handler trait and the registry that maps job kinds to handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::batch::ItemBatch;
use super::reporter::ProgressReporter;
use crate::error::HandlerError;
use crate::jobs::model::{JobKind, JobPriority, decode_payload};

/// Everything a handler gets for one attempt at a job.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    /// Zero on the first attempt.
    pub retry_count: u32,
    pub reporter: ProgressReporter,
    /// Pause between items of a multi-item job.
    pub item_delay: Duration,
    /// Cancelled when the worker is shutting down.
    pub shutdown: CancellationToken,
}

impl JobContext {
    /// Decode the payload into the handler's request type. A payload that
    /// does not decode is a permanent failure.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        decode_payload(self.job_id, &self.payload).map_err(HandlerError::from)
    }

    /// Process `items` one at a time with progress reporting.
    pub fn batch(&self, items: Vec<String>) -> ItemBatch<'_> {
        ItemBatch::new(self, items)
    }
}

/// What a successful handler returns.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub result: serde_json::Value,
    pub processed: u32,
    pub failed: u32,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext) -> Result<HandlerOutput, HandlerError>;
}

/// Maps each job kind to the handler that runs it.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }
}
