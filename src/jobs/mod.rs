//! Job model, update events, and the producer API.

pub mod events;
pub mod model;
pub mod producer;

pub use events::{JobEvent, JobEventType};
pub use model::{ItemStatus, Job, JobItem, JobKind, JobPriority, JobStatus, Progress, QueueMessage};
pub use producer::{JobProducer, QueueStats};
