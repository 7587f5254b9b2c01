//! Requests that start a classification job.
//!
//! The trigger's resolution is the second completion source fed into the
//! [`CompletionArbiter`](crate::CompletionArbiter).

use serde::Serialize;

/// Errors from triggering a job.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Classification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Classification rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl TriggerError {
    /// Message recorded on the operation when the trigger fails.
    pub fn operation_message(&self) -> String {
        match self {
            TriggerError::Rejected { body, .. } if !body.is_empty() => body.clone(),
            other => other.to_string(),
        }
    }
}

/// Starts the job identified by `job_id` on the classification service.
#[async_trait::async_trait]
pub trait JobTrigger: Send + Sync {
    /// Resolves when the service has accepted or finished the job.
    async fn trigger(&self, job_id: &str) -> Result<(), TriggerError>;
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    document_id: &'a str,
    enable_dual_verification: bool,
}

/// `POST {api_url}/api/classify/` trigger.
///
/// The service answers once classification has finished; the response body
/// is the classification result and is discarded here.
pub struct HttpJobTrigger {
    client: reqwest::Client,
    api_url: String,
    dual_verification: bool,
}

impl HttpJobTrigger {
    pub fn new(api_url: impl Into<String>, dual_verification: bool) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, dual_verification)
    }

    pub fn with_client(
        client: reqwest::Client,
        api_url: impl Into<String>,
        dual_verification: bool,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            dual_verification,
        }
    }

    pub fn classify_url(&self) -> String {
        format!("{}/api/classify/", self.api_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl JobTrigger for HttpJobTrigger {
    async fn trigger(&self, job_id: &str) -> Result<(), TriggerError> {
        let url = self.classify_url();
        tracing::debug!(job_id = %job_id, url = %url, "Triggering classification");

        let response = self
            .client
            .post(&url)
            .json(&ClassifyRequest {
                document_id: job_id,
                enable_dual_verification: self.dual_verification,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(TriggerError::Rejected {
            status: status.as_u16(),
            body: rejection_message(&body),
        })
    }
}

/// Extract FastAPI's `detail` from an error body, falling back to the raw text.
fn rejection_message(body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| match value.get("detail") {
            Some(serde_json::Value::String(detail)) => Some(detail.clone()),
            Some(other) if !other.is_null() => Some(other.to_string()),
            _ => None,
        });
    detail.unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_url_trims_trailing_slash() {
        let trigger = HttpJobTrigger::new("http://localhost:8000/", false);
        assert_eq!(trigger.classify_url(), "http://localhost:8000/api/classify/");
    }

    #[test]
    fn request_body_matches_service_schema() {
        let body = serde_json::to_value(ClassifyRequest {
            document_id: "doc-1",
            enable_dual_verification: true,
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"document_id": "doc-1", "enable_dual_verification": true})
        );
    }

    #[test]
    fn detail_string_is_extracted() {
        assert_eq!(
            rejection_message(r#"{"detail":"Document not found"}"#),
            "Document not found"
        );
    }

    #[test]
    fn structured_detail_is_rendered_as_json() {
        let message = rejection_message(r#"{"detail":[{"msg":"field required"}]}"#);
        assert!(message.contains("field required"));
    }

    #[test]
    fn non_json_body_is_used_verbatim() {
        assert_eq!(rejection_message("  Bad Gateway\n"), "Bad Gateway");
    }

    #[test]
    fn operation_message_prefers_body() {
        let err = TriggerError::Rejected {
            status: 404,
            body: "Document not found".into(),
        };
        assert_eq!(err.operation_message(), "Document not found");

        let empty = TriggerError::Rejected {
            status: 502,
            body: String::new(),
        };
        assert_eq!(empty.operation_message(), "Classification rejected (502): ");
    }
}
