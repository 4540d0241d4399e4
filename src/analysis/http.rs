//! HTTP client for the analysis service.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use super::{AnalysisBackend, ReportRequest, ResumeAnalysisRequest, SkillGapRequest};
use crate::config::AnalysisConfig;
use crate::error::AnalysisError;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

pub struct HttpAnalysisBackend {
    base_url: String,
    api_key: Option<SecretString>,
    client: reqwest::Client,
}

impl HttpAnalysisBackend {
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AnalysisError::RequestFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }

    async fn post<B: Serialize + Sync>(
        &self,
        endpoint: &'static str,
        body: &B,
    ) -> Result<serde_json::Value, AnalysisError> {
        let mut request = self.client.post(self.url(endpoint)).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let resp = request.send().await.map_err(|e| AnalysisError::RequestFailed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(endpoint, status, body));
        }

        debug!(endpoint, status = status.as_u16(), "Analysis request succeeded");
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| AnalysisError::InvalidResponse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }
}

/// 408, 429 and 5xx are worth retrying. Any other failure status means the
/// request itself is wrong.
fn classify_status(endpoint: &str, status: StatusCode, body: String) -> AnalysisError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        AnalysisError::Unavailable {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        }
    } else {
        let mut body = body;
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        AnalysisError::Rejected {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn analyze_resume(
        &self,
        request: &ResumeAnalysisRequest,
    ) -> Result<serde_json::Value, AnalysisError> {
        self.post("/analyze-resume", request).await
    }

    async fn analyze_skill_gap(
        &self,
        request: &SkillGapRequest,
    ) -> Result<serde_json::Value, AnalysisError> {
        self.post("/analyze-skill-gaps", request).await
    }

    async fn generate_report(
        &self,
        request: &ReportRequest,
    ) -> Result<serde_json::Value, AnalysisError> {
        self.post("/generate-report", request).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::HandlerError;

    #[test]
    fn server_errors_are_transient() {
        for code in [500, 502, 503, 408, 429] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status("/analyze-resume", status, String::new());
            assert!(!err.is_permanent(), "{code} should be retryable");
            assert!(matches!(HandlerError::from(err), HandlerError::Transient(_)));
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400, 401, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status("/analyze-resume", status, "nope".into());
            assert!(err.is_permanent(), "{code} should not be retried");
        }
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let err = classify_status("/generate-report", StatusCode::BAD_REQUEST, "é".repeat(600));
        let AnalysisError::Rejected { body, .. } = err else {
            panic!("expected rejection");
        };
        assert!(body.len() <= MAX_ERROR_BODY);
    }

    #[test]
    fn urls_join_base_and_endpoint() {
        let backend = HttpAnalysisBackend::new(&AnalysisConfig {
            base_url: "http://analysis.local:8000".into(),
            api_key: None,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            backend.url("/analyze-resume"),
            "http://analysis.local:8000/analyze-resume"
        );
    }

    #[tokio::test]
    async fn unreachable_service_is_transient() {
        let backend = HttpAnalysisBackend::new(&AnalysisConfig {
            base_url: "http://127.0.0.1:9".into(),
            api_key: Some(SecretString::from("test-key")),
            request_timeout: Duration::from_millis(500),
        })
        .unwrap();
        let err = backend
            .analyze_resume(&ResumeAnalysisRequest {
                resume_id: "r1".into(),
                job_description_id: "jd1".into(),
                user_id: "u1".into(),
                plan_type: "free".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::RequestFailed { .. }));
        assert!(!err.is_permanent());
    }
}
