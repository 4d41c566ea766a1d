pub mod retry;
pub mod transport;
pub mod types;

pub use retry::RetryPolicy;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport, TransportError};
pub use types::{
    ChangePage, Credentials, GitLabUser, MergeRequestQuery, MergeRequestRef, MergeRequestState,
    MergeRequestSummary, RawChangeEntry, UserFilter,
};

use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use types::DiffJson;

pub const DEFAULT_PER_PAGE: u32 = 50;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("GitLab rejected the access token (HTTP {status})")]
    Auth { status: u16 },

    #[error("Resource not found or not accessible: {resource}")]
    NotFound { resource: String },

    #[error("Rate limited by GitLab, gave up after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Network error after {attempts} attempts: {reason}")]
    Network { attempts: u32, reason: String },

    #[error("Request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("GitLab API returned HTTP {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Malformed GitLab response: {0}")]
    Malformed(String),

    #[error("Pagination cursor returned page {page} twice")]
    CursorLoop { page: String },
}

impl FetchError {
    /// Stable machine-readable name used in tool output.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Auth { .. } => "auth_error",
            FetchError::NotFound { .. } => "not_found_error",
            FetchError::RateLimited { .. } => "rate_limit_error",
            FetchError::Network { .. } => "network_error",
            FetchError::Timeout { .. } => "timeout_error",
            FetchError::UnexpectedStatus { .. } => "unexpected_status",
            FetchError::Malformed(_) => "malformed_response_error",
            FetchError::CursorLoop { .. } => "malformed_response_error",
        }
    }

    /// True when the cause was transient and the retry budget ran out,
    /// false when the request can never succeed as issued.
    pub fn retries_exhausted(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. } | FetchError::Network { .. } | FetchError::Timeout { .. }
        )
    }
}

/// Read-only GitLab REST client.
///
/// Each request is retried on its own: rate limiting with exponential backoff,
/// transient transport failures and 5xx with linear backoff. Auth and
/// not-found responses fail immediately.
#[derive(Clone)]
pub struct GitLabClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    per_page: u32,
}

impl GitLabClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            per_page: DEFAULT_PER_PAGE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, 100);
        self
    }

    /// Lazily walk the change pages of a merge request, starting at page 1.
    pub fn change_pages(&self, mr: &MergeRequestRef) -> ChangePages<'_> {
        let request = ApiRequest::new(format!(
            "/projects/{}/merge_requests/{}/diffs",
            encode_project(&mr.project_id),
            mr.iid
        ));
        ChangePages {
            inner: Pages::new(self, request),
        }
    }

    /// Fetch every change page of a merge request.
    ///
    /// Stops only when the server stops sending a next-page cursor or a page
    /// fails after its retries. There is no resume: a failed fetch is retried
    /// from page 1 by the next call.
    #[instrument(skip(self), fields(mr = %mr))]
    pub async fn fetch_changes(&self, mr: &MergeRequestRef) -> Result<Vec<ChangePage>, FetchError> {
        let mut pages = Vec::new();
        let mut cursor = self.change_pages(mr);
        while let Some(page) = cursor.next_page().await {
            let page = page?;
            debug!(page = %page.page, entries = page.entries.len(), next = ?page.next, "fetched change page");
            pages.push(page);
        }
        Ok(pages)
    }

    /// Whole-MR diff as plain text, used to recover entries GitLab truncated.
    #[instrument(skip(self), fields(mr = %mr))]
    pub async fn fetch_raw_diff(&self, mr: &MergeRequestRef) -> Result<String, FetchError> {
        let request = ApiRequest::new(format!(
            "/projects/{}/merge_requests/{}/raw_diffs",
            encode_project(&mr.project_id),
            mr.iid
        ));
        let response = self.send(&request).await?;
        debug!(bytes = response.body.len(), "received raw diff");
        Ok(response.body)
    }

    pub async fn current_user(&self) -> Result<GitLabUser, FetchError> {
        let response = self.send(&ApiRequest::new("/user")).await?;
        parse_json(&response.body)
    }

    /// Look up a user by exact email address. `/users?search=` matches
    /// loosely, so results are filtered to a byte-for-byte match. `None` when
    /// no user matches.
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<GitLabUser>, FetchError> {
        let request = ApiRequest::new("/users").query("search", email);
        let response = self.send(&request).await?;
        let users: Vec<GitLabUser> = parse_json(&response.body)?;
        Ok(users
            .into_iter()
            .find(|user| user.email.as_deref() == Some(email)))
    }

    #[instrument(skip(self, query), fields(state = query.state.as_str()))]
    pub async fn list_merge_requests(
        &self,
        project_id: &str,
        query: &MergeRequestQuery,
    ) -> Result<Vec<MergeRequestSummary>, FetchError> {
        let mut request = ApiRequest::new(format!(
            "/projects/{}/merge_requests",
            encode_project(project_id)
        ))
        .query("state", query.state.as_str())
        .query("scope", "all");
        if let Some(author) = query.author_id {
            request = request.query("author_id", author.to_string());
        }
        if let Some(assignee) = query.assignee_id {
            request = request.query("assignee_id", assignee.to_string());
        }

        let mut pages: Pages<'_, MergeRequestSummary> = Pages::new(self, request);
        let mut all: Vec<MergeRequestSummary> = Vec::new();
        while let Some(page) = pages.next_page().await {
            all.extend(page?.items);
        }
        for mr in &mut all {
            mr.author_email = mr.author.email.clone().unwrap_or_default();
        }
        debug!(count = all.len(), "listed merge requests");
        Ok(all)
    }

    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, FetchError> {
        let mut rate_limited = 0u32;
        let mut transient = 0u32;

        loop {
            let failure = match self.transport.get(request).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => match response.status {
                    401 | 403 => return Err(FetchError::Auth { status: response.status }),
                    404 => {
                        return Err(FetchError::NotFound {
                            resource: request.path.clone(),
                        })
                    }
                    429 => Failure::RateLimited(response.retry_after),
                    _ if response.retry_after.is_some() => Failure::RateLimited(response.retry_after),
                    500..=599 => Failure::Transient(TransportError::Connection(format!(
                        "HTTP {}",
                        response.status
                    ))),
                    status => {
                        return Err(FetchError::UnexpectedStatus {
                            status,
                            body: response.body.chars().take(200).collect(),
                        })
                    }
                },
                Err(err) => Failure::Transient(err),
            };

            let delay = match failure {
                Failure::RateLimited(hint) => {
                    rate_limited += 1;
                    if rate_limited >= self.retry.rate_limit_attempts {
                        return Err(FetchError::RateLimited {
                            attempts: rate_limited,
                        });
                    }
                    let delay = self.retry.rate_limit_delay(rate_limited, hint);
                    warn!(path = %request.path, attempt = rate_limited, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                    delay
                }
                Failure::Transient(err) => {
                    transient += 1;
                    if transient >= self.retry.network_attempts {
                        return Err(match err {
                            TransportError::Timeout => FetchError::Timeout { attempts: transient },
                            TransportError::Connection(reason) => FetchError::Network {
                                attempts: transient,
                                reason,
                            },
                        });
                    }
                    let delay = self.retry.network_delay(transient);
                    warn!(path = %request.path, attempt = transient, error = %err, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                    delay
                }
            };

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

enum Failure {
    RateLimited(Option<Duration>),
    Transient(TransportError),
}

/// GitLab accepts `group/project` paths in place of numeric ids when the
/// slash is percent-encoded.
pub fn encode_project(project_id: &str) -> String {
    project_id.replace('/', "%2F")
}

fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, FetchError> {
    serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))
}

/// One decoded page of a list endpoint.
struct Page<T> {
    page: String,
    items: Vec<T>,
    next: Option<String>,
}

/// Cursor over an `X-Next-Page` paginated list endpoint.
///
/// Finite and restartable only from the beginning. A cursor that points back
/// at a page already served ends the walk with `CursorLoop`.
struct Pages<'a, T> {
    client: &'a GitLabClient,
    request: ApiRequest,
    next: Option<String>,
    seen: HashSet<String>,
    _item: PhantomData<T>,
}

impl<'a, T: DeserializeOwned> Pages<'a, T> {
    fn new(client: &'a GitLabClient, request: ApiRequest) -> Self {
        Self {
            client,
            request,
            next: Some("1".to_string()),
            seen: HashSet::new(),
            _item: PhantomData,
        }
    }

    async fn next_page(&mut self) -> Option<Result<Page<T>, FetchError>> {
        let page = self.next.take()?;
        if !self.seen.insert(page.clone()) {
            return Some(Err(FetchError::CursorLoop { page }));
        }

        let request = self
            .request
            .clone()
            .query("page", page.clone())
            .query("per_page", self.client.per_page.to_string());

        let result = match self.client.send(&request).await {
            Ok(response) => parse_json::<Vec<T>>(&response.body).map(|items| Page {
                page,
                items,
                next: response.next_page,
            }),
            Err(err) => Err(err),
        };
        if let Ok(page) = &result {
            self.next = page.next.clone();
        }
        Some(result)
    }
}

/// Lazy, sequential walk over a merge request's change pages.
pub struct ChangePages<'a> {
    inner: Pages<'a, DiffJson>,
}

impl ChangePages<'_> {
    /// `None` once the server has signalled the last page or a page failed.
    pub async fn next_page(&mut self) -> Option<Result<ChangePage, FetchError>> {
        let page = self.inner.next_page().await?;
        Some(page.map(|page| ChangePage {
            page: page.page,
            entries: page.items.into_iter().map(RawChangeEntry::from).collect(),
            next: page.next,
        }))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub type Scripted = Result<ApiResponse, TransportError>;

    /// Transport that replays a fixed script of responses and records requests.
    #[derive(Default)]
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<ApiRequest>>,
    }

    impl ScriptedTransport {
        pub fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub fn requests(&self) -> Vec<ApiRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connection("script exhausted".to_string())))
        }
    }

    pub fn client(transport: Arc<ScriptedTransport>) -> GitLabClient {
        GitLabClient::new(transport).with_retry(RetryPolicy::immediate())
    }

    pub fn page(body: serde_json::Value, next: Option<&str>) -> Scripted {
        Ok(ApiResponse {
            status: 200,
            retry_after: None,
            next_page: next.map(str::to_string),
            body: body.to_string(),
        })
    }

    pub fn text(body: &str) -> Scripted {
        Ok(ApiResponse {
            status: 200,
            body: body.to_string(),
            ..ApiResponse::default()
        })
    }

    pub fn status(code: u16) -> Scripted {
        Ok(ApiResponse {
            status: code,
            body: format!("{{\"message\":\"{code}\"}}"),
            ..ApiResponse::default()
        })
    }

    pub fn rate_limited(retry_after: Option<u64>) -> Scripted {
        Ok(ApiResponse {
            status: 429,
            retry_after: retry_after.map(Duration::from_secs),
            ..ApiResponse::default()
        })
    }

    pub fn entry(old: &str, new: &str, diff: &str) -> serde_json::Value {
        serde_json::json!({
            "old_path": old,
            "new_path": new,
            "diff": diff,
            "a_mode": "100644",
            "b_mode": "100644",
            "new_file": false,
            "renamed_file": false,
            "deleted_file": false,
        })
    }
}
