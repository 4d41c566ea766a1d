//! MCP server exposing the retrieval core as tools.
//!
//! `fetch_merge_request_diffs` materializes a merge request on disk and
//! returns its manifest; `list_merge_requests` lists the configured project's
//! merge requests. Tool results are JSON text: the typed result on success,
//! `{"error": {kind, message, retryable}}` with `is_error` set otherwise.

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::gitlab::{
    FetchError, MergeRequestQuery, MergeRequestRef, MergeRequestState, MergeRequestSummary,
    UserFilter,
};
use crate::report;
use crate::retrieval::{DownloadManifest, RetrievalError, Retriever};

const INSTRUCTIONS: &str = "Read-only GitLab merge request tools.\n\
    fetch_merge_request_diffs(mr_iid, project_id?) writes every changed file of the merge request \
    as a unified diff under DOWNLOAD_PATH/<project>/<mr_iid>/<file>.diff and returns a manifest \
    with each file's status, written path, byte count and error, if any.\n\
    list_merge_requests(state?, filter_by?, git_email?) lists merge requests of the configured \
    project. Always show the returned 'display' field to the user.";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("User with email '{0}' not found")]
    UserNotFound(String),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::UserNotFound(_) => "not_found_error",
            ToolError::Retrieval(err) => err.kind(),
            ToolError::Fetch(err) => err.kind(),
            ToolError::Internal(_) => "internal_error",
        }
    }

    /// Whether calling again later may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            ToolError::Retrieval(err) => {
                err.retries_exhausted()
                    || matches!(err, RetrievalError::Timeout(_) | RetrievalError::AlreadyRunning(_))
            }
            ToolError::Fetch(err) => err.retries_exhausted(),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
                "retryable": self.retryable(),
            }
        })
    }
}

/// Everything the tools need, resolved once at startup.
pub struct ToolContext {
    pub retriever: Retriever,
    pub default_project: String,
    pub download_root: PathBuf,
}

/// A merge request IID as sent by the caller: `7` or `"7"`.
#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum IidArg {
    Number(u64),
    Text(String),
}

impl IidArg {
    fn parse(&self) -> Result<u64, ToolError> {
        let iid = match self {
            IidArg::Number(n) => Some(*n),
            IidArg::Text(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok(),
            IidArg::Text(_) => None,
        };
        iid.filter(|&n| n > 0)
            .ok_or_else(|| ToolError::InvalidArguments("MR IID must be a positive number".to_string()))
    }
}

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct FetchDiffsArgs {
    #[schemars(description = "Merge request IID, e.g. \"123\"")]
    pub mr_iid: IidArg,

    #[schemars(description = "Project id or path; defaults to PROJECT_ID")]
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct ListArgs {
    #[schemars(description = "opened (default), closed, merged, locked or all")]
    #[serde(default)]
    pub state: Option<String>,

    #[schemars(description = "all (default), assigned_to_me or created_by_me")]
    #[serde(default)]
    pub filter_by: Option<String>,

    #[schemars(description = "Filter by this user's email instead of the token owner")]
    #[serde(default)]
    pub git_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListFilter {
    pub state: MergeRequestState,
    pub filter_by: UserFilter,
    pub git_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRequestListing {
    /// Plain-text rendering meant to be shown as is
    pub display: String,
    pub merge_requests: Vec<MergeRequestSummary>,
    pub total_count: usize,
    pub filter: ListFilter,
}

#[instrument(skip(ctx, args, cancel), fields(mr_iid = ?args.mr_iid))]
pub async fn fetch_diffs(
    ctx: &ToolContext,
    args: FetchDiffsArgs,
    cancel: &CancellationToken,
) -> Result<DownloadManifest, ToolError> {
    let iid = args.mr_iid.parse()?;
    let project = match args.project_id {
        Some(project) if !project.trim().is_empty() => project.trim().to_string(),
        _ => ctx.default_project.clone(),
    };
    let mr = MergeRequestRef::new(project, iid);

    let manifest = ctx.retriever.retrieve(&mr, &ctx.download_root, cancel).await?;
    info!(mr = %mr, files = manifest.entries.len(), status = %manifest.status, "diffs fetched");
    Ok(manifest)
}

#[instrument(skip(ctx))]
pub async fn list_requests(ctx: &ToolContext, args: ListArgs) -> Result<MergeRequestListing, ToolError> {
    let state = args
        .state
        .as_deref()
        .map(str::parse::<MergeRequestState>)
        .transpose()
        .map_err(ToolError::InvalidArguments)?
        .unwrap_or_default();
    let filter_by = args
        .filter_by
        .as_deref()
        .map(str::parse::<UserFilter>)
        .transpose()
        .map_err(ToolError::InvalidArguments)?
        .unwrap_or_default();

    let client = ctx.retriever.client();
    let mut query = MergeRequestQuery {
        state,
        ..MergeRequestQuery::default()
    };

    if filter_by != UserFilter::All {
        let user_id = match args.git_email.as_deref() {
            Some(email) => {
                client
                    .find_user_by_email(email)
                    .await?
                    .ok_or_else(|| ToolError::UserNotFound(email.to_string()))?
                    .id
            }
            None => client.current_user().await?.id,
        };
        match filter_by {
            UserFilter::AssignedToMe => query.assignee_id = Some(user_id),
            UserFilter::CreatedByMe => query.author_id = Some(user_id),
            UserFilter::All => {}
        }
    }

    let merge_requests = client
        .list_merge_requests(&ctx.default_project, &query)
        .await?;
    Ok(MergeRequestListing {
        display: report::render_merge_requests(&merge_requests, false),
        total_count: merge_requests.len(),
        merge_requests,
        filter: ListFilter {
            state,
            filter_by,
            git_email: args.git_email,
        },
    })
}

/// MCP service over a shared `ToolContext`.
#[derive(Clone)]
pub struct MrDiffService {
    ctx: Arc<ToolContext>,
    /// Cancelled on shutdown; aborts in-flight retrievals
    cancel: CancellationToken,
    tool_router: ToolRouter<Self>,
}

impl MrDiffService {
    pub fn new(ctx: Arc<ToolContext>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl MrDiffService {
    #[tool(
        description = "Download every changed file of a GitLab merge request as a unified diff under DOWNLOAD_PATH/<project>/<mr_iid>/<file>.diff and return a manifest listing each file's status, written path, byte count and error, if any."
    )]
    pub async fn fetch_merge_request_diffs(
        &self,
        Parameters(args): Parameters<FetchDiffsArgs>,
    ) -> Result<CallToolResult, McpError> {
        Ok(into_result(
            "fetch_merge_request_diffs",
            fetch_diffs(&self.ctx, args, &self.cancel).await,
        ))
    }

    #[tool(
        description = "List merge requests of the configured project, filtered by state and by author or assignee. Returns a 'display' field to show to the user plus structured data."
    )]
    pub async fn list_merge_requests(
        &self,
        Parameters(args): Parameters<ListArgs>,
    ) -> Result<CallToolResult, McpError> {
        Ok(into_result(
            "list_merge_requests",
            list_requests(&self.ctx, args).await,
        ))
    }
}

#[tool_handler]
impl ServerHandler for MrDiffService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            ..Default::default()
        }
    }
}

/// Tool failures are reported in-band so the caller sees the error kind.
fn into_result<T: Serialize>(tool: &str, result: Result<T, ToolError>) -> CallToolResult {
    let rendered = result.and_then(|value| {
        serde_json::to_string_pretty(&value).map_err(|e| ToolError::Internal(e.to_string()))
    });
    match rendered {
        Ok(text) => CallToolResult::success(vec![Content::text(text)]),
        Err(err) => {
            warn!(tool, kind = err.kind(), error = %err, "tool call failed");
            CallToolResult::error(vec![Content::text(err.to_json().to_string())])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitlab::testing::*;
    use crate::retrieval::RetrievalOptions;

    fn service(transport: Arc<ScriptedTransport>, root: &std::path::Path) -> MrDiffService {
        let ctx = ToolContext {
            retriever: Retriever::new(client(transport), RetrievalOptions::default()),
            default_project: "42".to_string(),
            download_root: root.to_path_buf(),
        };
        MrDiffService::new(Arc::new(ctx), CancellationToken::new())
    }

    fn payload(result: &CallToolResult) -> Value {
        let text: String = result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect();
        serde_json::from_str(&text).unwrap()
    }

    fn fetch_args(args: Value) -> Parameters<FetchDiffsArgs> {
        Parameters(serde_json::from_value(args).unwrap())
    }

    fn mr_json(iid: u64) -> Value {
        json!({
            "iid": iid,
            "title": "Fix login",
            "state": "opened",
            "author": {"id": 5, "username": "dev", "name": "Dev", "email": "dev@example.com"},
            "source_branch": "fix",
            "target_branch": "main",
            "created_at": "2026-03-01T10:00:00Z",
            "web_url": "https://gitlab.example.com/g/p/-/merge_requests/1"
        })
    }

    #[tokio::test]
    async fn test_fetch_returns_manifest_json() {
        let root = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![page(
            json!([entry("src/a.go", "src/a.go", "@@ -1 +1 @@\n-a\n+b\n")]),
            None,
        )]);
        let service = service(transport, root.path());

        let result = service
            .fetch_merge_request_diffs(fetch_args(json!({"mr_iid": "7"})))
            .await
            .unwrap();
        assert!(!result.is_error.unwrap_or(false));
        let out = payload(&result);
        assert_eq!(out["status"], "complete");
        assert_eq!(out["project_id"], "42");
        assert_eq!(out["mr_iid"], 7);
        assert_eq!(out["entries"][0]["path"], "src/a.go");
        assert!(out["entries"][0]["bytes"].as_u64().unwrap() > 0);
        assert!(root.path().join("42/7/src/a.go.diff").exists());
    }

    #[tokio::test]
    async fn test_fetch_with_project_override_and_numeric_iid() {
        let root = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![page(json!([]), None)]);
        let service = service(transport.clone(), root.path());

        let result = service
            .fetch_merge_request_diffs(fetch_args(json!({"mr_iid": 12, "project_id": "group/app"})))
            .await
            .unwrap();
        assert_eq!(payload(&result)["project_id"], "group/app");
        assert_eq!(transport.requests()[0].path, "/projects/group%2Fapp/merge_requests/12/diffs");
    }

    #[tokio::test]
    async fn test_invalid_iid_is_rejected_without_network() {
        let root = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![]);
        let service = service(transport.clone(), root.path());

        for bad in [json!({"mr_iid": "12a"}), json!({"mr_iid": "0"}), json!({"mr_iid": ""})] {
            let result = service.fetch_merge_request_diffs(fetch_args(bad)).await.unwrap();
            assert_eq!(result.is_error, Some(true));
            assert_eq!(payload(&result)["error"]["kind"], "invalid_arguments");
        }
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_missing_iid_fails_to_deserialize() {
        assert!(serde_json::from_value::<FetchDiffsArgs>(json!({})).is_err());
    }

    #[tokio::test]
    async fn test_fetch_error_is_structured() {
        let root = tempfile::tempdir().unwrap();
        let service = service(ScriptedTransport::new(vec![status(404)]), root.path());
        let result = service
            .fetch_merge_request_diffs(fetch_args(json!({"mr_iid": "7"})))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        let out = payload(&result);
        assert_eq!(out["error"]["kind"], "not_found_error");
        assert_eq!(out["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn test_list_defaults_to_opened_for_everyone() {
        let root = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![page(json!([mr_json(1)]), None)]);
        let service = service(transport.clone(), root.path());

        let result = service
            .list_merge_requests(Parameters(ListArgs::default()))
            .await
            .unwrap();
        let out = payload(&result);
        assert_eq!(out["total_count"], 1);
        assert_eq!(out["filter"]["state"], "opened");
        assert_eq!(out["filter"]["filter_by"], "all");
        assert_eq!(out["merge_requests"][0]["author_email"], "dev@example.com");

        let display = out["display"].as_str().unwrap();
        assert!(display.starts_with("Merge Requests (1 found):"));
        assert!(display.contains("1. [opened] !1 - Fix login"));
        assert!(!display.contains('\u{1b}'));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_list_created_by_me_uses_current_user() {
        let root = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![
            page(json!({"id": 5, "username": "dev", "name": "Dev"}), None),
            page(json!([mr_json(3)]), None),
        ]);
        let service = service(transport.clone(), root.path());

        let args = ListArgs {
            state: Some("all".to_string()),
            filter_by: Some("created_by_me".to_string()),
            git_email: None,
        };
        let listing = list_requests(&service.ctx, args).await.unwrap();
        assert_eq!(listing.total_count, 1);

        let requests = transport.requests();
        assert_eq!(requests[0].path, "/user");
        assert_eq!(requests[1].param("author_id"), Some("5"));
        assert_eq!(requests[1].param("state"), Some("all"));
    }

    #[tokio::test]
    async fn test_list_unknown_email() {
        let root = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(vec![page(json!([]), None)]);
        let service = service(transport, root.path());
        let args = ListArgs {
            filter_by: Some("assigned_to_me".to_string()),
            git_email: Some("ghost@example.com".to_string()),
            ..ListArgs::default()
        };
        let err = list_requests(&service.ctx, args).await.unwrap_err();
        assert!(matches!(err, ToolError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_invalid_state() {
        let root = tempfile::tempdir().unwrap();
        let service = service(ScriptedTransport::new(vec![]), root.path());
        let args = ListArgs {
            state: Some("draft".to_string()),
            ..ListArgs::default()
        };
        let out = payload(&service.list_merge_requests(Parameters(args)).await.unwrap());
        assert_eq!(out["error"]["kind"], "invalid_arguments");
        assert!(out["error"]["message"].as_str().unwrap().contains("Invalid state"));
    }

    #[test]
    fn test_internal_error_is_not_blamed_on_caller() {
        let err = ToolError::Internal("serializer failed".to_string());
        assert_eq!(err.kind(), "internal_error");
        assert!(!err.retryable());

        let result = into_result::<()>("t", Err(err));
        assert_eq!(result.is_error, Some(true));
        assert_eq!(payload(&result)["error"]["kind"], "internal_error");
    }

    #[test]
    fn test_router_registers_both_tools() {
        let mut names: Vec<String> = MrDiffService::tool_router()
            .list_all()
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["fetch_merge_request_diffs", "list_merge_requests"]);
    }

    #[test]
    fn test_server_info_enables_tools() {
        let root = tempfile::tempdir().unwrap();
        let info = service(ScriptedTransport::new(vec![]), root.path()).get_info();
        assert!(info.capabilities.tools.is_some());
        assert!(info.instructions.unwrap().contains("display"));
    }
}
