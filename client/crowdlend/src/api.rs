//! HTTP client for the Crowdlend REST API.
//!
//! Attaches the session's bearer credential when one is stored and turns
//! non-2xx responses into [`ClientError::Http`]. Nothing is retried here;
//! the payment workflow owns the only retry policy in the crate.

use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::errors::{ClientError, Result};
use crate::session::{SessionKey, SharedSessionStore};

/// Request body variants accepted by [`ApiClient::post`].
pub enum Body {
    Json(Value),
    Multipart(Form),
}

impl Body {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }
}

/// Whether a request carries the stored bearer credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    Bearer,
    Anonymous,
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    session: SharedSessionStore,
}

impl ApiClient {
    pub fn new(base_url: &str, session: SharedSessionStore, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, base_url, session))
    }

    pub fn with_client(http: Client, base_url: &str, session: SharedSessionStore) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &SharedSessionStore {
        &self.session
    }

    /// `GET {base}{path}` with query `params`.
    pub async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let request = self.request(Method::GET, path, Auth::Bearer).await?;
        self.execute(Method::GET, path, request.query(params)).await
    }

    /// `GET` a path given as raw segments, each percent-encoded so a value
    /// taken from a payload cannot leave its own segment.
    pub async fn get_segments(
        &self,
        segments: &[&str],
        params: &[(&str, String)],
    ) -> Result<Value> {
        let url = self.segment_url(segments)?;
        let path = url.path().to_string();
        let request = self.authorize(self.http.get(url), Auth::Bearer).await?;
        self.execute(Method::GET, &path, request.query(params)).await
    }

    /// `POST {base}{path}` with a JSON or multipart body.
    pub async fn post(&self, path: &str, body: Body) -> Result<Value> {
        self.post_with(path, body, Auth::Bearer).await
    }

    pub async fn post_with(&self, path: &str, body: Body, auth: Auth) -> Result<Value> {
        let request = self.request(Method::POST, path, auth).await?;
        let request = match body {
            Body::Json(value) => request.json(&value),
            Body::Multipart(form) => request.multipart(form),
        };
        self.execute(Method::POST, path, request).await
    }

    async fn request(&self, method: Method, path: &str, auth: Auth) -> Result<RequestBuilder> {
        let url = format!("{}{}", self.base_url, normalise_path(path));
        self.authorize(self.http.request(method, url), auth).await
    }

    fn segment_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            ClientError::Config(format!("Invalid API base URL {}: {e}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                ClientError::Config(format!("API base URL {} cannot take a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn authorize(&self, mut request: RequestBuilder, auth: Auth) -> Result<RequestBuilder> {
        if auth == Auth::Bearer {
            if let Some(token) = self.session.get(SessionKey::Access).await? {
                if !token.is_empty() {
                    request = request.bearer_auth(token);
                }
            }
        }
        Ok(request)
    }

    async fn execute(&self, method: Method, path: &str, request: RequestBuilder) -> Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        debug!("{method} {path} -> {status}");

        if status.is_success() {
            return read_json(response).await;
        }

        let body = read_json(response).await.unwrap_or(Value::Null);
        Err(ClientError::Http {
            status,
            message: server_message(&body),
        })
    }
}

/// Decode a 2xx payload into `T`; shape mismatches are malformed responses.
pub fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| ClientError::MalformedResponse(format!("{what}: {e}")))
}

fn normalise_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Empty 2xx bodies decode as `null`.
async fn read_json(response: Response) -> Result<Value> {
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Pull a human-readable message out of an error body.
///
/// Checked in order: `error`, `message`, `detail`, `non_field_errors[0]`.
pub fn server_message(body: &Value) -> Option<String> {
    for key in ["error", "message", "detail"] {
        match body.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Array(items)) => {
                if let Some(s) = items.first().and_then(Value::as_str) {
                    return Some(s.to_string());
                }
            }
            _ => {}
        }
    }
    body.get("non_field_errors")
        .and_then(|v| v.get(0))
        .and_then(Value::as_str)
        .map(String::from)
}

// ─────────────────────────────────────────────────────────
// Multipart helpers
// ─────────────────────────────────────────────────────────

/// Append `value` to `form` unless it is empty.
pub fn text_field(form: Form, name: &'static str, value: &str) -> Form {
    if value.is_empty() {
        form
    } else {
        form.text(name, value.to_string())
    }
}

/// Append the file at `path` (if any) as field `name`.
pub async fn file_field(form: Form, name: &'static str, path: Option<&Path>) -> Result<Form> {
    let Some(path) = path else {
        return Ok(form);
    };
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    Ok(form.part(name, Part::bytes(bytes).file_name(file_name)))
}
