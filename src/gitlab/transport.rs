use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::types::Credentials;

/// A single GET against the GitLab API, relative to the API root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// Path below the API root, e.g. `/projects/42/merge_requests/7/diffs`
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// Value of a query parameter, if present.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// The parts of an HTTP response the client acts on.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed `Retry-After` (delta-seconds form only)
    pub retry_after: Option<Duration>,
    /// `X-Next-Page`; `None` when absent or empty
    pub next_page: Option<String>,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),
}

/// Seam between the client's retry/pagination logic and the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// reqwest-backed transport authenticating with a bearer token.
pub struct HttpTransport {
    client: reqwest::Client,
    credentials: Credentials,
}

impl HttpTransport {
    pub fn new(credentials: Credentials, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mr-diff-fetcher/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            credentials,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = format!(
            "{}{}",
            self.credentials.base_url.trim_end_matches('/'),
            request.path
        );
        debug!(url = %url, query = ?request.query, "GET");

        let response = self
            .client
            .get(&url)
            .query(&request.query)
            .bearer_auth(&self.credentials.token)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let next_page = header_value(response.headers(), "x-next-page");
        let body = response.text().await.map_err(classify)?;

        Ok(ApiResponse {
            status,
            retry_after,
            next_page,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(err.to_string())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Only the delta-seconds form is honored; HTTP-date values fall back to backoff.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
