use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::ResumeBatchPayload;
use crate::analysis::{AnalysisBackend, SkillGapRequest};
use crate::error::HandlerError;
use crate::worker::handler::{HandlerOutput, JobContext, JobHandler};

/// Runs skill-gap analysis for each resume of a batch.
pub struct SkillGapBatchHandler {
    backend: Arc<dyn AnalysisBackend>,
}

impl SkillGapBatchHandler {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl JobHandler for SkillGapBatchHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<HandlerOutput, HandlerError> {
        let payload: ResumeBatchPayload = ctx.payload()?;
        info!(job_id = %ctx.job_id, resumes = payload.resume_ids.len(), "Running skill-gap batch");

        ctx.batch(payload.resume_ids.clone())
            .run(|resume_id| {
                let backend = self.backend.clone();
                let request = SkillGapRequest {
                    resume_id,
                    job_description_id: payload.job_description_id.clone(),
                    user_id: payload.user_id.clone(),
                    plan_type: payload.plan_type.clone(),
                };
                async move {
                    backend
                        .analyze_skill_gap(&request)
                        .await
                        .map_err(HandlerError::from)
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handlers::testing::{FakeBackend, context};
    use crate::jobs::model::JobKind;

    #[tokio::test]
    async fn analyzes_every_resume() {
        let backend = Arc::new(FakeBackend::default());
        let handler = SkillGapBatchHandler::new(backend.clone());
        let (ctx, _store) = context(
            JobKind::SkillGapBatch,
            json!({"ResumeIds": ["a", "b"], "JobDescriptionId": "jd", "UserId": "u"}),
        )
        .await;

        let output = handler.handle(&ctx).await.unwrap();
        assert_eq!(output.processed, 2);
        assert_eq!(output.failed, 0);
        assert_eq!(output.result[0]["result"]["missing_skills"], json!(["rust"]));
        assert_eq!(backend.calls.lock().unwrap().len(), 2);
    }
}
