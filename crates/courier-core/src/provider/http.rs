//! Cancellable JSON requests shared by the HTTP adapters.

use reqwest::{RequestBuilder, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Send a request and decode the JSON body, aborting on cancellation.
///
/// 401 and 403 map to [`Error::ProviderUnauthorized`]; other failures map to
/// [`Error::ProviderFetch`].
pub(crate) async fn send_json(
    request: RequestBuilder,
    cancel: &CancellationToken,
) -> Result<serde_json::Value> {
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Cancelled),
        response = request.send() => response.map_err(|e| Error::ProviderFetch(e.to_string()))?,
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = format!("HTTP {status}: {}", truncate(&body, 200));
        return Err(
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                Error::ProviderUnauthorized(detail)
            } else {
                Error::ProviderFetch(detail)
            },
        );
    }

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        body = response.json::<serde_json::Value>() => {
            body.map_err(|e| Error::ProviderFetch(format!("invalid JSON body: {e}")))
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(idx, _)| &text[..idx])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_unauthorized_is_distinguished() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = send_json(client.get(server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderUnauthorized(ref m) if m.contains("bad token")));
    }

    #[tokio::test]
    async fn test_server_error_is_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let err = send_json(client.get(server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderFetch(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({}))
                    .set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = reqwest::Client::new();
        let err = send_json(client.get(server.uri()), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
