//! Client side of the AI analysis service that handlers call into.

pub mod http;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::AnalysisError;

pub use http::HttpAnalysisBackend;

/// Score one resume against a job description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeAnalysisRequest {
    pub resume_id: String,
    pub job_description_id: String,
    pub user_id: String,
    pub plan_type: String,
}

/// Skill-gap analysis for one resume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillGapRequest {
    pub resume_id: String,
    pub job_description_id: String,
    pub user_id: String,
    pub plan_type: String,
}

/// Build a report from earlier analyses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRequest {
    pub report_type: String,
    pub job_description_id: String,
    pub resume_analysis_ids: Vec<String>,
    pub user_id: String,
    pub plan_type: String,
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn analyze_resume(
        &self,
        request: &ResumeAnalysisRequest,
    ) -> Result<serde_json::Value, AnalysisError>;

    async fn analyze_skill_gap(
        &self,
        request: &SkillGapRequest,
    ) -> Result<serde_json::Value, AnalysisError>;

    async fn generate_report(
        &self,
        request: &ReportRequest,
    ) -> Result<serde_json::Value, AnalysisError>;
}
