//! Admission control: a counting semaphore shared by every consumer loop.
//!
//! A permit is taken before a topic is polled and travels with the job into
//! its task. Dropping the permit is the only way to release it, so the
//! in-flight count stays correct on every exit path, panics included.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Proof of admission. Released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free slot. Returns `None` once the controller is closed.
    pub async fn acquire(&self) -> Option<AdmissionPermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Jobs currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Wake every waiter with `None`. Permits already handed out stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
