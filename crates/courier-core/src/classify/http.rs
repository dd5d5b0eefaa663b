//! Classifier reached over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::{Classifier, ClassifierError};
use crate::connection::WorkspaceId;
use crate::message::MessageId;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyRequest<'a> {
    message_id: String,
    workspace_id: &'a str,
}

/// Posts `{"messageId", "workspaceId"}` to a classification endpoint.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpClassifier {
    /// Create a classifier for an endpoint.
    #[must_use]
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        message_id: MessageId,
        workspace_id: &WorkspaceId,
    ) -> Result<(), ClassifierError> {
        let body = ClassifyRequest {
            message_id: message_id.to_string(),
            workspace_id: workspace_id.as_str(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout
                } else {
                    ClassifierError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Rejected {
                message: message_id,
                status: status.as_u16(),
            });
        }

        debug!(message = %message_id, workspace = %workspace_id, "message classified");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_posts_message_and_workspace() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .and(body_json(serde_json::json!({
                "messageId": "42",
                "workspaceId": "ws-1"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let classifier = HttpClassifier::new(Client::new(), format!("{}/classify", server.uri()));
        classifier
            .classify(MessageId::new(42), &WorkspaceId::new("ws-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_status_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let classifier = HttpClassifier::new(Client::new(), server.uri());
        let err = classifier
            .classify(MessageId::new(1), &WorkspaceId::new("ws-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Rejected { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let classifier = HttpClassifier::new(Client::new(), server.uri())
            .with_timeout(Duration::from_millis(50));
        let err = classifier
            .classify(MessageId::new(1), &WorkspaceId::new("ws-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Timeout));
    }
}
