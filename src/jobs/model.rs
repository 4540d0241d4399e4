//! Job model and state machine.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Kind of work a job carries. Each kind has its own pair of queue topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Score many resumes against one job description.
    BulkAnalysis,
    /// Build a single hiring report from prior analyses.
    ReportGeneration,
    /// Skill-gap analysis for a batch of resumes.
    SkillGapBatch,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::BulkAnalysis,
        JobKind::ReportGeneration,
        JobKind::SkillGapBatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BulkAnalysis => "bulk_analysis",
            Self::ReportGeneration => "report_generation",
            Self::SkillGapBatch => "skill_gap_batch",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bulk_analysis" => Ok(Self::BulkAnalysis),
            "report_generation" => Ok(Self::ReportGeneration),
            "skill_gap_batch" => Ok(Self::SkillGapBatch),
            other => Err(JobError::UnknownType(other.to_string())),
        }
    }
}

/// Scheduling priority. Within a poll cycle, high always beats normal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

// Producers written against the numeric API send `priority: 0 | 1`;
// anything above zero is high.
impl<'de> Deserialize<'de> for JobPriority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Level(i64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
            Repr::Level(level) if level > 0 => Ok(Self::High),
            Repr::Level(_) => Ok(Self::Normal),
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a broker topic.
    Queued,
    /// Admitted and running in a handler.
    Processing,
    /// Handler returned a result.
    Completed,
    /// Failed permanently, exhausted retries, or timed out.
    Failed,
    /// Cancelled by the requester before finishing.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Status of a single item inside a multi-item job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown item status '{other}'")),
        }
    }
}

/// A persisted job row.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub retry_count: u32,
    pub total_items: u32,
    pub processed_items: u32,
    pub failed_items: u32,
    pub progress_percentage: f64,
    pub current_item: Option<String>,
    /// Set once, only on completion.
    pub result_data: Option<serde_json::Value>,
    /// Set once, only on failure.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// First entry into processing.
    pub started_at: Option<DateTime<Utc>>,
    /// Entry into any terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// After this, a terminal job may be purged.
    pub expires_at: DateTime<Utc>,
}

impl Job {
    /// Create a freshly queued job that expires `retention` after creation.
    pub fn new(
        kind: JobKind,
        priority: JobPriority,
        payload: serde_json::Value,
        total_items: u32,
        retention: Duration,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), kind, priority, payload, total_items, retention)
    }

    fn with_id(
        id: Uuid,
        kind: JobKind,
        priority: JobPriority,
        payload: serde_json::Value,
        total_items: u32,
        retention: Duration,
    ) -> Self {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(1));
        Self {
            id,
            kind,
            priority,
            payload,
            status: JobStatus::Queued,
            retry_count: 0,
            total_items,
            processed_items: 0,
            failed_items: 0,
            progress_percentage: 0.0,
            current_item: None,
            result_data: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            expires_at: now + retention,
        }
    }

    /// Rebuild a queued row from a popped message whose row is missing.
    pub fn from_message(message: &QueueMessage, retention: Duration) -> Result<Self, JobError> {
        let kind = message.kind()?;
        let mut job = Self::with_id(
            message.job_id,
            kind,
            message.priority,
            message.data.clone(),
            0,
            retention,
        );
        job.retry_count = message.retry_count;
        Ok(job)
    }

    /// The broker message that carries this job.
    pub fn to_message(&self) -> QueueMessage {
        QueueMessage {
            job_id: self.id,
            job_type: self.kind.as_str().to_string(),
            data: self.payload.clone(),
            retry_count: self.retry_count,
            priority: self.priority,
        }
    }

    /// How long the job has been (or was) processing.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            let duration = end.signed_duration_since(start);
            Duration::from_secs(duration.num_seconds().max(0) as u64)
        })
    }
}

/// A persisted per-item row of a multi-item job.
#[derive(Debug, Clone, Serialize)]
pub struct JobItem {
    pub job_id: Uuid,
    pub item_id: String,
    pub status: ItemStatus,
    pub result_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Progress counters reported while a job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub processed_items: u32,
    pub failed_items: u32,
    pub progress_percentage: f64,
    pub current_item: Option<String>,
}

impl Progress {
    pub fn new(processed: u32, failed: u32, percentage: f64, current_item: Option<String>) -> Self {
        Self {
            processed_items: processed,
            failed_items: failed,
            progress_percentage: percentage.clamp(0.0, 100.0),
            current_item,
        }
    }
}

/// Message carried on a `queue:{job_type}:{priority}` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: Uuid,
    /// Kept as a raw string so unknown kinds can be failed instead of lost.
    pub job_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub priority: JobPriority,
}

impl QueueMessage {
    pub fn kind(&self) -> Result<JobKind, JobError> {
        self.job_type.parse()
    }

    pub fn encode(&self) -> Result<String, JobError> {
        serde_json::to_string(self).map_err(|e| JobError::MalformedMessage(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, JobError> {
        serde_json::from_str(raw).map_err(|e| JobError::MalformedMessage(e.to_string()))
    }

    /// Same message with a new retry count.
    pub fn with_retry_count(&self, retry_count: u32) -> Self {
        Self {
            retry_count,
            ..self.clone()
        }
    }
}

/// Best-effort recovery of the job id from a message that failed to decode.
pub fn salvage_job_id(raw: &str) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("job_id")?.as_str()?.parse().ok()
}

/// Decode a handler payload. Accepts either an object or a string holding
/// JSON, since some producers double-encode `data`.
pub fn decode_payload<T: DeserializeOwned>(
    job_id: Uuid,
    data: &serde_json::Value,
) -> Result<T, JobError> {
    let parsed = match data {
        serde_json::Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|e| JobError::InvalidPayload {
        id: job_id,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn job_kind_parse_and_display() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!(matches!(
            "resume_rewrite".parse::<JobKind>(),
            Err(JobError::UnknownType(t)) if t == "resume_rewrite"
        ));
    }

    #[test]
    fn priority_accepts_names_and_levels() {
        let high: JobPriority = serde_json::from_value(json!("high")).unwrap();
        let numeric_high: JobPriority = serde_json::from_value(json!(1)).unwrap();
        let numeric_normal: JobPriority = serde_json::from_value(json!(0)).unwrap();
        assert_eq!(high, JobPriority::High);
        assert_eq!(numeric_high, JobPriority::High);
        assert_eq!(numeric_normal, JobPriority::Normal);
        assert!(serde_json::from_value::<JobPriority>(json!("urgent")).is_err());
    }

    #[test]
    fn message_defaults_missing_fields() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"job_id":"{id}","job_type":"bulk_analysis"}}"#);
        let msg = QueueMessage::decode(&raw).unwrap();
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.priority, JobPriority::Normal);
        assert_eq!(msg.kind().unwrap(), JobKind::BulkAnalysis);
    }

    #[test]
    fn message_wire_shape() {
        let job = Job::new(
            JobKind::ReportGeneration,
            JobPriority::High,
            json!({"ReportType": "summary"}),
            1,
            Duration::from_secs(3600),
        );
        let value = serde_json::to_value(job.to_message()).unwrap();
        assert_eq!(value["job_type"], "report_generation");
        assert_eq!(value["priority"], "high");
        assert_eq!(value["retry_count"], 0);
        assert_eq!(value["data"]["ReportType"], "summary");
    }

    #[test]
    fn salvage_id_from_partial_message() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"job_id":"{id}","retry_count":"lots"}}"#);
        assert!(QueueMessage::decode(&raw).is_err());
        assert_eq!(salvage_job_id(&raw), Some(id));
        assert_eq!(salvage_job_id("not json"), None);
    }

    #[test]
    fn decode_payload_handles_double_encoding() {
        #[derive(Deserialize)]
        struct P {
            name: String,
        }
        let id = Uuid::new_v4();
        let direct: P = decode_payload(id, &json!({"name": "a"})).unwrap();
        let nested: P = decode_payload(id, &json!(r#"{"name":"b"}"#)).unwrap();
        assert_eq!(direct.name, "a");
        assert_eq!(nested.name, "b");
        assert!(decode_payload::<P>(id, &json!(42)).is_err());
    }

    #[test]
    fn new_job_is_queued_with_expiry() {
        let job = Job::new(
            JobKind::BulkAnalysis,
            JobPriority::Normal,
            json!({}),
            3,
            Duration::from_secs(24 * 3600),
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.total_items, 3);
        assert!(job.started_at.is_none());
        assert_eq!((job.expires_at - job.created_at).num_hours(), 24);
    }
}
