//! `send_webhook`: an outbound HTTP call without a stored integration.

use super::{ActionHandler, ActionInput};
use crate::error::ActionError;
use async_trait::async_trait;
use autoflow_integration::http::{bounded_timeout, parse_method};
use autoflow_integration::{ConnectorError, HttpRequest, HttpTransport};
use reqwest::Method;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tracing::warn;

/// Params: `url` (required), `method` (default POST), `headers`, `data`,
/// `timeout` seconds. Returns `{status, headers, body}`.
#[derive(Debug, Clone)]
pub struct SendWebhookHandler {
    transport: HttpTransport,
    default_timeout: Duration,
}

impl SendWebhookHandler {
    #[must_use]
    pub fn new(transport: HttpTransport, default_timeout: Duration) -> Self {
        Self {
            transport,
            default_timeout,
        }
    }
}

fn webhook_error(url: &str, err: &ConnectorError) -> ActionError {
    ActionError::Webhook {
        url: url.to_string(),
        status: err.status(),
        response: err.response().cloned(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl ActionHandler for SendWebhookHandler {
    async fn execute(&self, input: ActionInput<'_>) -> Result<JsonValue, ActionError> {
        let url = input
            .param_str("url")
            .ok_or_else(|| ActionError::invalid("'url' is required"))?;
        let method = parse_method(input.param_str("method"), Method::POST)
            .map_err(|e| ActionError::invalid(e.to_string()))?;
        let timeout = bounded_timeout(Some(
            input
                .param("timeout")
                .and_then(JsonValue::as_u64)
                .map_or(self.default_timeout, Duration::from_secs),
        ));

        let mut request = HttpRequest::new(method, url).headers_from(input.param("headers"));
        if let Some(data) = input.param("data") {
            request = request.json(data.clone());
        }

        let response = self
            .transport
            .send(request, timeout)
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| {
                warn!(url, error = %e, "Webhook delivery failed");
                webhook_error(url, &e)
            })?;

        Ok(json!({
            "status": response.status,
            "headers": response.headers,
            "body": response.body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn handler() -> SendWebhookHandler {
        SendWebhookHandler::new(HttpTransport::new().expect("transport"), Duration::from_secs(5))
    }

    async fn run(params: JsonValue) -> Result<JsonValue, ActionError> {
        handler()
            .execute(ActionInput {
                params: &params,
                integration: None,
                context: &json!({}),
            })
            .await
    }

    #[tokio::test]
    async fn posts_data_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-signature", "abc"))
            .and(body_json(json!({"order": 7})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let result = run(json!({
            "url": format!("{}/hook", server.uri()),
            "headers": {"x-signature": "abc"},
            "data": {"order": 7},
        }))
        .await
        .expect("webhook");
        assert_eq!(result["status"], json!(200));
        assert_eq!(result["body"], json!({"ok": true}));
    }

    #[tokio::test]
    async fn non_success_status_is_webhook_error_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({"error": "bad"})))
            .mount(&server)
            .await;

        let err = run(json!({"url": server.uri(), "method": "put"}))
            .await
            .expect_err("422");
        assert_eq!(err.kind(), ErrorKind::WebhookError);
        match err {
            ActionError::Webhook { status, response, .. } => {
                assert_eq!(status, Some(422));
                assert_eq!(response, Some(json!({"error": "bad"})));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_url_is_webhook_error() {
        let err = run(json!({"url": "http://127.0.0.1:1/hook"}))
            .await
            .expect_err("unreachable");
        assert_eq!(err.kind(), ErrorKind::WebhookError);
    }

    #[tokio::test]
    async fn url_is_required() {
        let err = run(json!({"data": {}})).await.expect_err("no url");
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}
