pub mod client;
pub mod server;

use crate::error::{RpcError, RpcResult};
use client::{HttpClient, ReqwestClient};
use http::{
    header::{HeaderName, HeaderValue, CONTENT_TYPE},
    HeaderMap,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use server::Middleware;
use std::{collections::BTreeMap, sync::Arc};

/// One invocation on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Outcome of one [`Request`]. Exactly one of `result`/`error` is meaningful;
/// a missing `error` means success, even when `result` is absent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: String, name: String, result: Value) -> Self {
        Self {
            id,
            name,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: String, name: String, error: impl ToString) -> Self {
        Self {
            id,
            name,
            result: None,
            error: Some(error.to_string()),
        }
    }

    pub fn into_result(self) -> RpcResult {
        match self.error {
            Some(message) => Err(RpcError::Remote(message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    pub endpoint: String,
    pub base_url: Option<String>,
    /// Merged over `Content-Type: application/json` on outgoing requests.
    pub headers: BTreeMap<String, String>,
    pub health_path: String,
    /// Largest inbound batch body, and largest response line, in bytes.
    pub max_body: usize,
}

impl HttpTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn url(&self) -> String {
        resolve_url(self.base_url.as_deref(), &self.endpoint)
    }
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "/irpc".into(),
            base_url: None,
            headers: BTreeMap::new(),
            health_path: "/health".into(),
            max_body: 1024 * 1024,
        }
    }
}

/// `base_url` followed by `endpoint` with its slashes collapsed.
pub fn resolve_url(base_url: Option<&str>, endpoint: &str) -> String {
    let base = base_url.unwrap_or_default().trim_end_matches('/');
    let path = endpoint
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("{base}/{path}")
}

/// JSON-over-HTTP transport: batches go out as one POST, results stream
/// back as one JSON object per line.
pub struct HttpTransport {
    config: HttpTransportConfig,
    url: String,
    headers: HeaderMap,
    client: Arc<dyn HttpClient>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> RpcResult<Self> {
        Self::with_client(config, Arc::new(ReqwestClient::default()))
    }

    pub fn with_client(
        config: HttpTransportConfig,
        client: Arc<dyn HttpClient>,
    ) -> RpcResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &config.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| RpcError::Config(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| RpcError::Config(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }
        Ok(Self {
            url: config.url(),
            config,
            headers,
            client,
            middleware: Vec::new(),
        })
    }

    /// Register middleware run before each inbound batch is dispatched.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collapses_slashes() {
        assert_eq!(resolve_url(None, "irpc"), "/irpc");
        assert_eq!(resolve_url(None, "//irpc///batch"), "/irpc/batch");
        assert_eq!(
            resolve_url(Some("http://localhost:3000/"), "/irpc"),
            "http://localhost:3000/irpc"
        );
        assert_eq!(
            resolve_url(Some("http://localhost:3000/api"), "v1//irpc"),
            "http://localhost:3000/api/v1/irpc"
        );
    }

    #[test]
    fn headers_extend_and_override_defaults() {
        let config = HttpTransportConfig::new("/irpc")
            .base_url("http://localhost:3000")
            .header("authorization", "Bearer token")
            .header("content-type", "application/x-ndjson");
        let transport = HttpTransport::new(config).unwrap();

        assert_eq!(transport.url(), "http://localhost:3000/irpc");
        assert_eq!(transport.headers()["authorization"], "Bearer token");
        assert_eq!(transport.headers()[CONTENT_TYPE], "application/x-ndjson");
    }

    #[test]
    fn rejects_invalid_headers() {
        let config = HttpTransportConfig::new("/irpc").header("bad header", "x");
        assert!(matches!(HttpTransport::new(config), Err(RpcError::Config(_))));
    }

    #[test]
    fn response_lines_omit_the_unused_side() {
        let ok = Response::ok("1".into(), "multiply".into(), json!(12));
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"id":"1","name":"multiply","result":12}"#
        );
        let err = Response::err("2".into(), "nope".into(), "IRPC can not be found.");
        assert_eq!(
            err.into_result(),
            Err(RpcError::Remote("IRPC can not be found.".into()))
        );

        let bare: Response = serde_json::from_str(r#"{"id":"3","name":"ping"}"#).unwrap();
        assert_eq!(bare.into_result(), Ok(Value::Null));
    }

    #[test]
    fn config_from_json() {
        let config: HttpTransportConfig = serde_json::from_value(json!({
            "endpoint": "rpc",
            "base_url": "http://example.com",
        }))
        .unwrap();
        assert_eq!(config.url(), "http://example.com/rpc");
        assert_eq!(config.health_path, "/health");
        assert_eq!(config.max_body, 1024 * 1024);
    }
}
