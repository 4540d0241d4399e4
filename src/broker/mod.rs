//! Message broker abstraction: priority list topics plus pub/sub channels.
//!
//! Topics are FIFO lists. Producers push at the head and consumers pop from
//! the tail, so the oldest message leaves first.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::jobs::model::{JobKind, JobPriority};

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Push a message onto a topic.
    async fn push(&self, topic: &str, payload: &str) -> Result<(), BrokerError>;

    /// Pop the oldest message from a topic, waiting at most `timeout`.
    async fn pop(&self, topic: &str, timeout: Duration) -> Result<Option<String>, BrokerError>;

    /// Publish to a pub/sub channel. Delivery is fire-and-forget.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Number of messages waiting on a topic.
    async fn depth(&self, topic: &str) -> Result<usize, BrokerError>;

    /// Release connections. Further calls fail with `BrokerError::Closed`.
    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Topic name for a job kind and priority: `queue:{job_type}:{high|normal}`.
pub fn queue_topic(kind: JobKind, priority: JobPriority) -> String {
    format!("queue:{}:{}", kind.as_str(), priority.as_str())
}

/// Pub/sub channel carrying updates for one job.
pub fn updates_channel(job_id: Uuid) -> String {
    format!("job_updates:{job_id}")
}
