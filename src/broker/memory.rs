//! In-process broker for tests and single-node development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;

use super::Broker;
use crate::error::BrokerError;

/// Capacity of each pub/sub channel.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Topic {
    messages: VecDeque<String>,
    ready: Arc<Notify>,
}

#[derive(Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Topic>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    /// Every published message, in order, when recording is enabled.
    history: Option<Mutex<Vec<(String, String)>>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that also keeps every published message for inspection.
    pub fn recording() -> Self {
        Self {
            history: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Subscribe to a pub/sub channel. Only messages published after this
    /// call are received.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        lock(&self.channels)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Messages published on `channel` so far. Empty unless recording.
    pub fn published(&self, channel: &str) -> Vec<String> {
        match &self.history {
            Some(history) => lock(history)
                .iter()
                .filter(|(c, _)| c == channel)
                .map(|(_, payload)| payload.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Messages waiting on `topic`, oldest first. Readable after `close`.
    pub fn pending(&self, topic: &str) -> Vec<String> {
        lock(&self.topics)
            .get(topic)
            .map(|entry| entry.messages.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    /// Pop if a message is ready, otherwise hand back the topic's notifier.
    fn try_pop(&self, topic: &str) -> Result<String, Arc<Notify>> {
        let mut topics = lock(&self.topics);
        let entry = topics.entry(topic.to_string()).or_default();
        match entry.messages.pop_back() {
            Some(message) => Ok(message),
            None => Err(entry.ready.clone()),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topics = lock(&self.topics);
        let entry = topics.entry(topic.to_string()).or_default();
        entry.messages.push_front(payload.to_string());
        // notify_one stores a permit, so a popper that has not started
        // waiting yet still sees this push.
        entry.ready.notify_one();
        Ok(())
    }

    async fn pop(&self, topic: &str, timeout: Duration) -> Result<Option<String>, BrokerError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            let ready = match self.try_pop(topic) {
                Ok(message) => return Ok(Some(message)),
                Err(ready) => ready,
            };
            if tokio::time::timeout_at(deadline, ready.notified())
                .await
                .is_err()
            {
                return Ok(self.try_pop(topic).ok());
            }
            self.ensure_open()?;
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if let Some(history) = &self.history {
            lock(history).push((channel.to_string(), payload.to_string()));
        }
        if let Some(tx) = lock(&self.channels).get(channel) {
            // No subscribers is fine
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn depth(&self, topic: &str) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        Ok(lock(&self.topics)
            .get(topic)
            .map(|t| t.messages.len())
            .unwrap_or(0))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
