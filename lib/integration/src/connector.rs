//! Provider adapters.
//!
//! Each integration type has an adapter that turns `(integration config,
//! params, credentials)` into one HTTP call. Adapters only build and send
//! requests; rate limiting and statistics belong to `IntegrationClient`.

use crate::credential::CredentialSet;
use crate::error::ConnectorError;
use crate::http::{
    DEFAULT_TIMEOUT, HttpRequest, HttpResponse, HttpTransport, bounded_timeout, parse_method,
    scalar_to_string,
};
use crate::integration::Integration;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value as JsonValue, json};
use std::time::Duration;

/// Everything an adapter needs for one call.
#[derive(Debug, Clone, Copy)]
pub struct ProviderCall<'a> {
    pub integration: &'a Integration,
    pub params: &'a JsonValue,
    pub context: &'a JsonValue,
    pub credentials: &'a CredentialSet,
}

impl<'a> ProviderCall<'a> {
    fn param(&self, key: &str) -> Option<&'a JsonValue> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    fn param_str(&self, key: &str) -> Option<&'a str> {
        self.params.get(key).and_then(JsonValue::as_str)
    }

    /// A param, falling back to the integration config entry of the same name.
    fn setting(&self, key: &str) -> Option<&'a str> {
        self.param_str(key)
            .or_else(|| self.integration.config_str(key))
    }

    fn timeout(&self, adapter_default: Duration) -> Duration {
        let requested = self
            .params
            .get("timeout")
            .and_then(JsonValue::as_u64)
            .map(Duration::from_secs)
            .or_else(|| self.integration.timeout_override())
            .unwrap_or(adapter_default);
        bounded_timeout(Some(requested))
    }
}

/// Executes calls for one integration type.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short adapter name for logs.
    fn name(&self) -> &'static str;

    /// Timeout used when neither params nor the integration override it.
    fn default_timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Performs the call. Non-2xx responses are errors.
    async fn call(&self, call: ProviderCall<'_>) -> Result<HttpResponse, ConnectorError>;
}

fn missing(operation: &str, what: &str) -> ConnectorError {
    ConnectorError::InvalidParameters {
        operation: operation.to_string(),
        reason: format!("missing '{what}'"),
    }
}

/// Outbound webhook: `url`, `method` (default POST), `headers`, `data`.
#[derive(Debug, Clone)]
pub struct WebhookAdapter {
    transport: HttpTransport,
}

impl WebhookAdapter {
    #[must_use]
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProviderAdapter for WebhookAdapter {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn call(&self, call: ProviderCall<'_>) -> Result<HttpResponse, ConnectorError> {
        let url = call.setting("url").ok_or_else(|| missing("webhook", "url"))?;
        let method = parse_method(call.setting("method"), Method::POST)?;
        let body = call
            .param("data")
            .or_else(|| call.param("payload"))
            .cloned()
            .unwrap_or_else(|| call.context.get("input").cloned().unwrap_or(json!({})));

        let mut request = HttpRequest::new(method.clone(), url)
            .headers_from(call.integration.config.get("headers"))
            .headers_from(call.param("headers"))
            .auth(call.credentials.auth_header());
        if method != Method::GET {
            request = request.json(body);
        }

        self.transport
            .send(request, call.timeout(self.default_timeout()))
            .await?
            .error_for_status()
    }
}

/// Generic REST API: `config.base_url` plus `endpoint`, `method` (default
/// GET), `query`, `headers`, `body`.
#[derive(Debug, Clone)]
pub struct RestAdapter {
    transport: HttpTransport,
}

impl RestAdapter {
    #[must_use]
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProviderAdapter for RestAdapter {
    fn name(&self) -> &'static str {
        "generic_api"
    }

    async fn call(&self, call: ProviderCall<'_>) -> Result<HttpResponse, ConnectorError> {
        let base = call
            .integration
            .config_str("base_url")
            .ok_or_else(|| missing("generic_api", "config.base_url"))?;
        let endpoint = call.param_str("endpoint").unwrap_or_default();
        let url = join_url(base, endpoint);
        let method = parse_method(call.param_str("method"), Method::GET)?;

        let mut request = HttpRequest::new(method, url)
            .headers_from(call.integration.config.get("headers"))
            .headers_from(call.param("headers"))
            .query_from(call.param("query"))
            .auth(call.credentials.auth_header());
        if let Some(body) = call.param("body").or_else(|| call.param("data")) {
            request = request.json(body.clone());
        }

        self.transport
            .send(request, call.timeout(self.default_timeout()))
            .await?
            .error_for_status()
    }
}

/// Chat notification through an incoming webhook: posts `{text, channel}`
/// to `config.webhook_url`.
#[derive(Debug, Clone)]
pub struct ChatAdapter {
    transport: HttpTransport,
}

impl ChatAdapter {
    #[must_use]
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProviderAdapter for ChatAdapter {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn call(&self, call: ProviderCall<'_>) -> Result<HttpResponse, ConnectorError> {
        let url = call
            .setting("webhook_url")
            .ok_or_else(|| missing("chat", "webhook_url"))?;
        let text = call
            .param_str("message")
            .or_else(|| call.param_str("text"))
            .ok_or_else(|| missing("chat", "message"))?;

        let mut body = json!({ "text": text });
        if let Some(channel) = call.setting("channel") {
            body["channel"] = json!(channel);
        }
        if let Some(username) = call.setting("username") {
            body["username"] = json!(username);
        }
        if let Some(blocks) = call.param("blocks") {
            body["blocks"] = blocks.clone();
        }

        let request = HttpRequest::new(Method::POST, url)
            .auth(call.credentials.auth_header())
            .json(body);
        self.transport
            .send(request, call.timeout(self.default_timeout()))
            .await?
            .error_for_status()
    }
}

/// Payment processor speaking a form-encoded REST dialect.
///
/// `operation` selects the endpoint: `create_charge`, `create_customer`,
/// `create_refund`, or `retrieve_charge` (needs `id`). Flat `data` fields
/// become form fields.
#[derive(Debug, Clone)]
pub struct PaymentAdapter {
    transport: HttpTransport,
}

impl PaymentAdapter {
    pub const DEFAULT_API_BASE: &'static str = "https://api.stripe.com/v1";

    #[must_use]
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProviderAdapter for PaymentAdapter {
    fn name(&self) -> &'static str {
        "payment"
    }

    async fn call(&self, call: ProviderCall<'_>) -> Result<HttpResponse, ConnectorError> {
        let base = call
            .integration
            .config_str("api_base")
            .unwrap_or(Self::DEFAULT_API_BASE);
        let operation = call
            .param_str("operation")
            .ok_or_else(|| missing("payment", "operation"))?;

        let (method, path) = match operation {
            "create_charge" => (Method::POST, "charges".to_string()),
            "create_customer" => (Method::POST, "customers".to_string()),
            "create_refund" => (Method::POST, "refunds".to_string()),
            "retrieve_charge" => {
                let id = call
                    .param_str("id")
                    .ok_or_else(|| missing("retrieve_charge", "id"))?;
                (Method::GET, format!("charges/{id}"))
            }
            other => {
                return Err(ConnectorError::OperationNotSupported {
                    operation: other.to_string(),
                });
            }
        };

        let mut request =
            HttpRequest::new(method.clone(), join_url(base, &path)).auth(call.credentials.auth_header());
        if method == Method::POST {
            let fields = match call.param("data") {
                Some(JsonValue::Object(map)) => map
                    .iter()
                    .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                    .collect(),
                _ => Vec::new(),
            };
            request = request.form(fields);
        }

        self.transport
            .send(request, call.timeout(self.default_timeout()))
            .await?
            .error_for_status()
    }
}

/// Transactional email over an HTTP mail API at `config.api_url`.
///
/// Sends `{from, to, cc, subject, text, html}`; `from` falls back to
/// `config.from_address`.
#[derive(Debug, Clone)]
pub struct EmailAdapter {
    transport: HttpTransport,
}

impl EmailAdapter {
    #[must_use]
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProviderAdapter for EmailAdapter {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn call(&self, call: ProviderCall<'_>) -> Result<HttpResponse, ConnectorError> {
        let url = call
            .integration
            .config_str("api_url")
            .ok_or_else(|| missing("email", "config.api_url"))?;
        let to = recipients(call.param("to"));
        if to.is_empty() {
            return Err(missing("email", "to"));
        }
        let from = call
            .param_str("from")
            .or_else(|| call.integration.config_str("from_address"))
            .ok_or_else(|| missing("email", "from"))?;

        let body = json!({
            "from": from,
            "to": to,
            "cc": recipients(call.param("cc")),
            "subject": call.param_str("subject").unwrap_or_default(),
            "text": call.param_str("body").unwrap_or_default(),
            "html": call.param_str("html"),
        });

        let request = HttpRequest::new(Method::POST, url)
            .auth(call.credentials.auth_header())
            .json(body);
        self.transport
            .send(request, call.timeout(self.default_timeout()))
            .await?
            .error_for_status()
    }
}

/// Normalizes a recipient param (string, comma list, or array) into addresses.
#[must_use]
pub fn recipients(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::IntegrationType;
    use autoflow_core::OrganizationId;
    use serde_json::Map;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new().expect("transport")
    }

    fn creds(value: JsonValue) -> CredentialSet {
        match value {
            JsonValue::Object(map) => CredentialSet::from(map),
            _ => CredentialSet::from(Map::new()),
        }
    }

    #[test]
    fn recipients_accepts_strings_and_lists() {
        assert_eq!(
            recipients(Some(&json!("a@x.io, b@x.io"))),
            vec!["a@x.io".to_string(), "b@x.io".to_string()]
        );
        assert_eq!(recipients(Some(&json!(["c@x.io"]))), vec!["c@x.io".to_string()]);
        assert!(recipients(None).is_empty());
    }

    #[test]
    fn url_joining() {
        assert_eq!(join_url("https://a.io/", "/v1/x"), "https://a.io/v1/x");
        assert_eq!(join_url("https://a.io", ""), "https://a.io");
    }

    #[tokio::test]
    async fn webhook_posts_data_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(header("authorization", "Bearer s3cret"))
            .and(body_json(json!({"order": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let integration = Integration::new(OrganizationId::new(), "hook", IntegrationType::Webhook)
            .with_config("url", format!("{}/events", server.uri()));
        let params = json!({"data": {"order": 1}});
        let credentials = creds(json!({"token": "s3cret"}));
        let response = WebhookAdapter::new(transport())
            .call(ProviderCall {
                integration: &integration,
                params: &params,
                context: &json!({}),
                credentials: &credentials,
            })
            .await
            .expect("call");
        assert_eq!(response.body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn rest_adapter_reports_non_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/items"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "nope"})))
            .mount(&server)
            .await;

        let integration = Integration::new(OrganizationId::new(), "api", IntegrationType::GenericApi)
            .with_config("base_url", format!("{}/v1", server.uri()));
        let params = json!({"endpoint": "items"});
        let err = RestAdapter::new(transport())
            .call(ProviderCall {
                integration: &integration,
                params: &params,
                context: &json!({}),
                credentials: &CredentialSet::empty(),
            })
            .await
            .expect_err("404");
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn chat_requires_message() {
        let integration = Integration::new(OrganizationId::new(), "chat", IntegrationType::Chat)
            .with_config("webhook_url", "http://127.0.0.1:1/");
        let err = ChatAdapter::new(transport())
            .call(ProviderCall {
                integration: &integration,
                params: &json!({}),
                context: &json!({}),
                credentials: &CredentialSet::empty(),
            })
            .await
            .expect_err("missing message");
        assert!(matches!(err, ConnectorError::InvalidParameters { .. }));
    }

    #[tokio::test]
    async fn chat_posts_text_and_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"text": "deployed", "channel": "#ops"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let integration = Integration::new(OrganizationId::new(), "chat", IntegrationType::Chat)
            .with_config("webhook_url", server.uri())
            .with_config("channel", "#ops");
        let params = json!({"message": "deployed"});
        let response = ChatAdapter::new(transport())
            .call(ProviderCall {
                integration: &integration,
                params: &params,
                context: &json!({}),
                credentials: &CredentialSet::empty(),
            })
            .await
            .expect("call");
        assert_eq!(response.body, json!("ok"));
    }

    #[tokio::test]
    async fn payment_creates_charge_with_form_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/charges"))
            .and(body_string_contains("amount=500"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ch_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let integration = Integration::new(OrganizationId::new(), "pay", IntegrationType::Payment)
            .with_config("api_base", format!("{}/v1", server.uri()));
        let params = json!({"operation": "create_charge", "data": {"amount": 500, "currency": "usd"}});
        let response = PaymentAdapter::new(transport())
            .call(ProviderCall {
                integration: &integration,
                params: &params,
                context: &json!({}),
                credentials: &creds(json!({"api_key": "sk_test"})),
            })
            .await
            .expect("call");
        assert_eq!(response.body["id"], json!("ch_1"));
    }

    #[tokio::test]
    async fn payment_rejects_unknown_operation() {
        let integration = Integration::new(OrganizationId::new(), "pay", IntegrationType::Payment);
        let err = PaymentAdapter::new(transport())
            .call(ProviderCall {
                integration: &integration,
                params: &json!({"operation": "mint_money"}),
                context: &json!({}),
                credentials: &CredentialSet::empty(),
            })
            .await
            .expect_err("unsupported");
        assert!(matches!(err, ConnectorError::OperationNotSupported { .. }));
    }

    #[tokio::test]
    async fn email_uses_configured_sender() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(body_string_contains("\"from\":\"noreply@x.io\""))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let integration = Integration::new(OrganizationId::new(), "mail", IntegrationType::Email)
            .with_config("api_url", format!("{}/send", server.uri()))
            .with_config("from_address", "noreply@x.io");
        let params = json!({"to": "a@x.io", "subject": "Hi", "body": "Hello"});
        let response = EmailAdapter::new(transport())
            .call(ProviderCall {
                integration: &integration,
                params: &params,
                context: &json!({}),
                credentials: &CredentialSet::empty(),
            })
            .await
            .expect("call");
        assert_eq!(response.status, 202);
    }
}
