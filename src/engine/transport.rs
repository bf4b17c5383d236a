//! Raw access to an engine's JSON API.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;

/// Whether a call reads state (`view`) or changes it (`action`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    View,
    Action,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::View => "view",
            CallKind::Action => "action",
        }
    }
}

/// One request/response exchange with an engine instance.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    async fn request(
        &self,
        component: &str,
        kind: CallKind,
        name: &str,
        params: &[(&str, String)],
    ) -> Result<Value, EngineError>;
}

/// Transport over the engine's local HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(http: reqwest::Client, host: &str, port: u16, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base: format!("http://{host}:{port}"),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl EngineTransport for HttpTransport {
    async fn request(
        &self,
        component: &str,
        kind: CallKind,
        name: &str,
        params: &[(&str, String)],
    ) -> Result<Value, EngineError> {
        let url = format!("{}/JSON/{component}/{}/{name}/", self.base, kind.as_str());
        let resp = self
            .http
            .get(&url)
            .query(&[("apikey", self.api_key.as_str())])
            .query(params)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| EngineError::malformed(format!("{component}/{name}"), e.to_string()))
    }
}

/// Error for a non-2xx answer. The engine's own `code`/`message` win when the
/// body is JSON; otherwise the HTTP status and raw body are kept.
fn api_error(status: u16, text: &str) -> EngineError {
    let body: Option<Value> = serde_json::from_str(text).ok();
    let field = |name: &str| {
        body.as_ref()
            .and_then(|b| b.get(name))
            .and_then(Value::as_str)
            .map(str::to_owned)
    };
    let code = field("code").unwrap_or_else(|| status.to_string());
    let message = field("message").unwrap_or_else(|| {
        let raw = text.trim();
        if raw.is_empty() {
            "no message".to_owned()
        } else {
            raw.chars().take(200).collect()
        }
    });
    EngineError::Api { code, message }
}
