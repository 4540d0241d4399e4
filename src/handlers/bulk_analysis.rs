use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::ResumeBatchPayload;
use crate::analysis::{AnalysisBackend, ResumeAnalysisRequest};
use crate::error::HandlerError;
use crate::worker::handler::{HandlerOutput, JobContext, JobHandler};

/// Scores each resume of a batch against one job description.
pub struct BulkAnalysisHandler {
    backend: Arc<dyn AnalysisBackend>,
}

impl BulkAnalysisHandler {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl JobHandler for BulkAnalysisHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<HandlerOutput, HandlerError> {
        let payload: ResumeBatchPayload = ctx.payload()?;
        info!(job_id = %ctx.job_id, resumes = payload.resume_ids.len(), "Running bulk analysis");

        ctx.batch(payload.resume_ids.clone())
            .run(|resume_id| {
                let backend = self.backend.clone();
                let request = ResumeAnalysisRequest {
                    resume_id,
                    job_description_id: payload.job_description_id.clone(),
                    user_id: payload.user_id.clone(),
                    plan_type: payload.plan_type.clone(),
                };
                async move {
                    backend
                        .analyze_resume(&request)
                        .await
                        .map_err(HandlerError::from)
                }
            })
            .await
    }
}
