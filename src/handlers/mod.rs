//! Handlers for each job kind, backed by the analysis service.

pub mod bulk_analysis;
pub mod report_generation;
pub mod skill_gap;

use std::sync::Arc;

use serde::Deserialize;

use crate::analysis::AnalysisBackend;
use crate::jobs::model::JobKind;
use crate::worker::handler::HandlerRegistry;

pub use bulk_analysis::BulkAnalysisHandler;
pub use report_generation::ReportGenerationHandler;
pub use skill_gap::SkillGapBatchHandler;

fn default_plan_type() -> String {
    "free".to_string()
}

/// Payload shared by the per-resume batch kinds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResumeBatchPayload {
    pub resume_ids: Vec<String>,
    pub job_description_id: String,
    pub user_id: String,
    #[serde(default = "default_plan_type")]
    pub plan_type: String,
}

/// Registry with a handler for every job kind.
pub fn default_registry(backend: Arc<dyn AnalysisBackend>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            JobKind::BulkAnalysis,
            Arc::new(BulkAnalysisHandler::new(backend.clone())),
        )
        .register(
            JobKind::ReportGeneration,
            Arc::new(ReportGenerationHandler::new(backend.clone())),
        )
        .register(
            JobKind::SkillGapBatch,
            Arc::new(SkillGapBatchHandler::new(backend)),
        );
    registry
}
