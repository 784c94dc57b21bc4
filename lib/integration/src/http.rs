//! Shared HTTP transport for provider adapters and webhook steps.

use crate::error::ConnectorError;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::time::Duration;

/// Timeout applied when neither the adapter nor the integration overrides it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on any per-call timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// Clamps a requested timeout to `(0, MAX_TIMEOUT]`, falling back to the default for zero.
#[must_use]
pub fn bounded_timeout(requested: Option<Duration>) -> Duration {
    match requested {
        Some(d) if d.is_zero() => DEFAULT_TIMEOUT,
        Some(d) => d.min(MAX_TIMEOUT),
        None => DEFAULT_TIMEOUT,
    }
}

/// Request body variants the adapters need.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(JsonValue),
    Form(Vec<(String, String)>),
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds every string-valued entry of a JSON object as a header.
    #[must_use]
    pub fn headers_from(mut self, headers: Option<&JsonValue>) -> Self {
        if let Some(JsonValue::Object(map)) = headers {
            for (name, value) in map {
                self.headers.push((name.clone(), scalar_to_string(value)));
            }
        }
        self
    }

    /// Adds every entry of a JSON object as a query parameter.
    #[must_use]
    pub fn query_from(mut self, query: Option<&JsonValue>) -> Self {
        if let Some(JsonValue::Object(map)) = query {
            for (name, value) in map {
                self.query.push((name.clone(), scalar_to_string(value)));
            }
        }
        self
    }

    #[must_use]
    pub fn json(mut self, body: JsonValue) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    #[must_use]
    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    /// Adds the given auth header, if any.
    #[must_use]
    pub fn auth(mut self, header: Option<(String, String)>) -> Self {
        if let Some(header) = header {
            self.headers.push(header);
        }
        self
    }
}

/// A normalized response: status, lowercased headers, and a JSON body
/// (non-JSON bodies become a JSON string).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: JsonValue,
}

impl HttpResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into `ConnectorError::HttpStatus`.
    ///
    /// # Errors
    ///
    /// Returns the status and body when the status is not 2xx.
    pub fn error_for_status(self) -> Result<Self, ConnectorError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ConnectorError::HttpStatus {
                status: self.status,
                body: self.body,
            })
        }
    }

    /// `{status, headers, body}` as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        let headers: Map<String, JsonValue> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect();
        serde_json::json!({
            "status": self.status,
            "headers": headers,
            "body": self.body,
        })
    }
}

/// A cloneable reqwest client with per-request timeouts.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport whose client-level timeout is `MAX_TIMEOUT`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .timeout(MAX_TIMEOUT)
            .user_agent(concat!("autoflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConnectorError::ProtocolError {
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Sends `request`, waiting at most `timeout`.
    ///
    /// Non-2xx responses are returned as `Ok`; use
    /// [`HttpResponse::error_for_status`] to reject them.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `ConnectionFailed` when no response arrives.
    pub async fn send(
        &self,
        request: HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, ConnectorError> {
        let timeout = bounded_timeout(Some(timeout));
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(&body),
            RequestBody::Form(fields) => builder.form(&fields),
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout {
                    timeout_secs: timeout.as_secs(),
                }
            } else {
                ConnectorError::ConnectionFailed {
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout {
                    timeout_secs: timeout.as_secs(),
                }
            } else {
                ConnectorError::ProtocolError {
                    reason: e.to_string(),
                }
            }
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body: parse_body(&text),
        })
    }
}

fn parse_body(text: &str) -> JsonValue {
    if text.is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}

/// Renders a JSON scalar the way it should appear in a header, query, or form field.
#[must_use]
pub fn scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parses an HTTP method name, case-insensitively.
///
/// # Errors
///
/// Returns `InvalidParameters` for an unknown method.
pub fn parse_method(value: Option<&str>, default: Method) -> Result<Method, ConnectorError> {
    let Some(value) = value else {
        return Ok(default);
    };
    Method::from_bytes(value.to_ascii_uppercase().as_bytes()).map_err(|_| {
        ConnectorError::InvalidParameters {
            operation: "http".to_string(),
            reason: format!("unknown HTTP method '{value}'"),
        }
    })
}
