//! Remote API client
//!
//! Each [`EntityKind`] maps to one `POST` endpoint. A successful response
//! carries the created entity (with its server-assigned id) as JSON; a
//! failure carries `{ "message": string }` and a status that separates
//! terminal client rejections (4xx) from transient server trouble (5xx).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::{EntityKind, PendingMutation};

/// Header carrying the per-mutation idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Errors from talking to the remote API
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Connection refused, DNS failure, dropped connection
    #[error("Network error: {0}")]
    Network(String),

    /// No response within the submission deadline
    #[error("Request timed out")]
    Timeout,

    /// 5xx response
    #[error("Server unavailable ({status}): {message}")]
    ServerUnavailable { status: u16, message: String },

    /// 4xx response; resending the same request will not help
    #[error("Rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// 2xx response whose body is not JSON (reads only)
    #[error("Invalid response body: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether the same request may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::ServerUnavailable { .. }
        )
    }

    /// Classify a non-2xx response
    pub fn from_response(status: u16, body: &str) -> Self {
        let message = extract_message(status, body);
        if (400..500).contains(&status) {
            RemoteError::Rejected { status, message }
        } else {
            RemoteError::ServerUnavailable { status, message }
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Network(error.to_string())
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn extract_message(status: u16, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.message;
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.chars().take(200).collect();
    }
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unknown error")
        .to_string()
}

/// The server the queue drains into
pub trait RemoteApi: Send + Sync + 'static {
    /// `POST` the mutation payload to its endpoint; returns the created entity
    fn submit(
        &self,
        mutation: &PendingMutation,
    ) -> impl Future<Output = Result<Value, RemoteError>> + Send;

    /// `GET` a resource, for the read cache
    fn fetch(&self, path: &str) -> impl Future<Output = Result<Value, RemoteError>> + Send;
}

impl<T: RemoteApi> RemoteApi for Arc<T> {
    fn submit(
        &self,
        mutation: &PendingMutation,
    ) -> impl Future<Output = Result<Value, RemoteError>> + Send {
        (**self).submit(mutation)
    }

    fn fetch(&self, path: &str) -> impl Future<Output = Result<Value, RemoteError>> + Send {
        (**self).fetch(path)
    }
}

/// Authentication state supplied by the host application
///
/// The engine only reads it; signing in and out happens elsewhere.
pub trait SessionContext: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

impl SessionContext for bool {
    fn is_authenticated(&self) -> bool {
        *self
    }
}

impl SessionContext for AtomicBool {
    fn is_authenticated(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

/// `reqwest`-based client for the REST API
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpRemote {
    /// Create a client for `base_url`; `timeout` bounds each request
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for an endpoint path
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Absolute URL a mutation of `kind` is posted to
    pub fn endpoint_url(&self, kind: EntityKind) -> String {
        self.url(kind.endpoint())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl RemoteApi for HttpRemote {
    async fn submit(&self, mutation: &PendingMutation) -> Result<Value, RemoteError> {
        let url = self.endpoint_url(mutation.entity_type);
        debug!("POST {} (mutation {})", url, mutation.id);

        let request = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, mutation.idempotency_key.to_string())
            .json(&mutation.payload);
        let response = self.authorize(request).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            // Accepted even if the body is not JSON
            Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
        } else {
            Err(RemoteError::from_response(status.as_u16(), &body))
        }
    }

    async fn fetch(&self, path: &str) -> Result<Value, RemoteError> {
        let url = self.url(path);
        debug!("GET {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
        } else {
            Err(RemoteError::from_response(status.as_u16(), &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let rejected = RemoteError::from_response(422, r#"{"message":"name is required"}"#);
        assert_eq!(
            rejected,
            RemoteError::Rejected {
                status: 422,
                message: "name is required".into()
            }
        );
        assert!(!rejected.is_transient());

        let unavailable = RemoteError::from_response(503, "");
        assert!(unavailable.is_transient());
        assert!(unavailable.to_string().contains("Service Unavailable"));

        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(!RemoteError::InvalidResponse("eof".into()).is_transient());
    }

    #[test]
    fn test_plain_text_error_body() {
        let err = RemoteError::from_response(400, "  bad input  ");
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 400,
                message: "bad input".into()
            }
        );
    }

    #[test]
    fn test_url_joining() {
        let remote = HttpRemote::new("https://example.org/", Duration::from_secs(5)).unwrap();
        assert_eq!(remote.base_url(), "https://example.org");
        assert_eq!(
            remote.endpoint_url(EntityKind::ScreenedChild),
            "https://example.org/api/screened-children"
        );
        assert_eq!(remote.url("api/sessions"), "https://example.org/api/sessions");
    }

    #[test]
    fn test_session_contexts() {
        assert!(true.is_authenticated());
        let flag = AtomicBool::new(false);
        assert!(!flag.is_authenticated());
        flag.store(true, Ordering::SeqCst);
        assert!(flag.is_authenticated());
    }
}
