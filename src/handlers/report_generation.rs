use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::analysis::{AnalysisBackend, ReportRequest};
use crate::error::HandlerError;
use crate::jobs::model::{ItemStatus, Progress};
use crate::worker::handler::{HandlerOutput, JobContext, JobHandler};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportPayload {
    pub report_type: String,
    pub job_description_id: String,
    #[serde(default)]
    pub resume_analysis_ids: Vec<String>,
    pub user_id: String,
    #[serde(default = "super::default_plan_type")]
    pub plan_type: String,
}

/// Generates one report from earlier analyses. The report type doubles as
/// the job's single item id.
pub struct ReportGenerationHandler {
    backend: Arc<dyn AnalysisBackend>,
}

impl ReportGenerationHandler {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl JobHandler for ReportGenerationHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<HandlerOutput, HandlerError> {
        let payload: ReportPayload = ctx.payload()?;
        let item_id = payload.report_type.clone();
        info!(job_id = %ctx.job_id, report_type = %item_id, "Generating report");

        ctx.reporter
            .update_progress(
                ctx.job_id,
                Progress::new(0, 0, 25.0, Some("Generating report...".into())),
            )
            .await;
        ctx.reporter
            .update_item_status(ctx.job_id, &item_id, ItemStatus::Processing, None, None)
            .await;

        let request = ReportRequest {
            report_type: payload.report_type,
            job_description_id: payload.job_description_id,
            resume_analysis_ids: payload.resume_analysis_ids,
            user_id: payload.user_id,
            plan_type: payload.plan_type,
        };

        match self.backend.generate_report(&request).await {
            Ok(report) => {
                ctx.reporter
                    .update_progress(
                        ctx.job_id,
                        Progress::new(1, 0, 100.0, Some("Report completed".into())),
                    )
                    .await;
                ctx.reporter
                    .update_item_status(
                        ctx.job_id,
                        &item_id,
                        ItemStatus::Completed,
                        Some(&report),
                        None,
                    )
                    .await;
                Ok(HandlerOutput {
                    result: report,
                    processed: 1,
                    failed: 0,
                })
            }
            Err(e) => {
                let message = e.to_string();
                ctx.reporter
                    .update_item_status(
                        ctx.job_id,
                        &item_id,
                        ItemStatus::Failed,
                        None,
                        Some(&message),
                    )
                    .await;
                Err(HandlerError::from(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handlers::testing::{FakeBackend, context};
    use crate::jobs::model::JobKind;
    use crate::store::JobStore;

    fn payload() -> serde_json::Value {
        json!({
            "ReportType": "shortlist",
            "JobDescriptionId": "jd1",
            "ResumeAnalysisIds": ["a1", "a2"],
            "UserId": "u1"
        })
    }

    #[tokio::test]
    async fn report_completes_single_item() {
        let handler = ReportGenerationHandler::new(Arc::new(FakeBackend::default()));
        let (ctx, store) = context(JobKind::ReportGeneration, payload()).await;

        let output = handler.handle(&ctx).await.unwrap();
        assert_eq!(output.processed, 1);
        assert_eq!(output.result["candidates"], 2);

        let job = store.get_job(ctx.job_id).await.unwrap().unwrap();
        assert_eq!(job.progress_percentage, 100.0);
        assert_eq!(job.current_item.as_deref(), Some("Report completed"));

        let items = store.list_items(ctx.job_id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, "shortlist");
        assert_eq!(items[0].status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn rejected_report_marks_item_failed() {
        let backend = FakeBackend {
            reject_reports: true,
            ..FakeBackend::default()
        };
        let handler = ReportGenerationHandler::new(Arc::new(backend));
        let (ctx, store) = context(JobKind::ReportGeneration, payload()).await;

        let err = handler.handle(&ctx).await.unwrap_err();
        assert!(err.is_permanent());

        let items = store.list_items(ctx.job_id).await.unwrap();
        assert_eq!(items[0].status, ItemStatus::Failed);
        assert!(items[0].error_message.as_deref().unwrap().contains("422"));
    }
}
