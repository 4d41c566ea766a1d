use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connection details for one GitLab instance.
/// Immutable for the process lifetime. The token is redacted from `Debug`.
#[derive(Clone)]
pub struct Credentials {
    /// API root, e.g. `https://gitlab.com/api/v4`
    pub base_url: String,
    /// Personal or project access token
    pub token: String,
    /// Default project (numeric id or `group/project` path)
    pub project_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("project_id", &self.project_id)
            .finish()
    }
}

/// Identifies the merge request one retrieval works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeRequestRef {
    pub project_id: String,
    pub iid: u64,
}

impl MergeRequestRef {
    pub fn new(project_id: impl Into<String>, iid: u64) -> Self {
        Self {
            project_id: project_id.into(),
            iid,
        }
    }
}

impl fmt::Display for MergeRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.project_id, self.iid)
    }
}

/// One file entry as reported by a single page of the diffs endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChangeEntry {
    pub old_path: String,
    pub new_path: String,
    /// Diff fragment as sent by the server, usually starting at the first `@@`
    pub diff: String,
    pub renamed: bool,
    pub deleted: bool,
    pub new_file: bool,
    pub binary: bool,
    /// GitLab withheld the fragment (`too_large` or `collapsed`)
    pub truncated: bool,
    pub a_mode: Option<String>,
    pub b_mode: Option<String>,
}

/// One page of change entries plus the cursor of the page after it.
#[derive(Debug, Clone)]
pub struct ChangePage {
    /// Cursor value this page was requested with
    pub page: String,
    pub entries: Vec<RawChangeEntry>,
    /// `None` once the server signals there are no further pages
    pub next: Option<String>,
}

/// Wire shape of one element of `GET .../merge_requests/:iid/diffs`.
#[derive(Debug, Deserialize)]
pub(crate) struct DiffJson {
    #[serde(default)]
    pub old_path: Option<String>,
    #[serde(default)]
    pub new_path: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub a_mode: Option<String>,
    #[serde(default)]
    pub b_mode: Option<String>,
    #[serde(default)]
    pub new_file: bool,
    #[serde(default)]
    pub renamed_file: bool,
    #[serde(default)]
    pub deleted_file: bool,
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub too_large: bool,
    #[serde(default)]
    pub collapsed: bool,
}

impl From<DiffJson> for RawChangeEntry {
    fn from(json: DiffJson) -> Self {
        let diff = json.diff.unwrap_or_default();
        let binary = json.binary || diff.starts_with("Binary files ");
        Self {
            old_path: json.old_path.unwrap_or_default(),
            new_path: json.new_path.unwrap_or_default(),
            diff,
            renamed: json.renamed_file,
            deleted: json.deleted_file,
            new_file: json.new_file,
            binary,
            truncated: json.too_large || json.collapsed,
            a_mode: json.a_mode.filter(|m| !m.is_empty()),
            b_mode: json.b_mode.filter(|m| !m.is_empty()),
        }
    }
}

/// GitLab user as returned by `/user` and `/users`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitLabUser {
    pub id: u64,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Merge request listing entry, trimmed to what the listing tool reports.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MergeRequestSummary {
    pub iid: u64,
    pub title: String,
    pub state: String,
    pub author: GitLabUser,
    pub source_branch: String,
    pub target_branch: String,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    pub web_url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignees: Vec<GitLabUser>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub upvotes: u64,
    #[serde(default)]
    pub downvotes: u64,
    /// Copied from `author.email`; empty when GitLab does not expose it
    #[serde(skip_deserializing)]
    pub author_email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
    #[default]
    Opened,
    Closed,
    Merged,
    Locked,
    All,
}

impl MergeRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeRequestState::Opened => "opened",
            MergeRequestState::Closed => "closed",
            MergeRequestState::Merged => "merged",
            MergeRequestState::Locked => "locked",
            MergeRequestState::All => "all",
        }
    }
}

impl FromStr for MergeRequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opened" => Ok(MergeRequestState::Opened),
            "closed" => Ok(MergeRequestState::Closed),
            "merged" => Ok(MergeRequestState::Merged),
            "locked" => Ok(MergeRequestState::Locked),
            "all" => Ok(MergeRequestState::All),
            other => Err(format!(
                "Invalid state '{other}'. Must be one of: opened, closed, merged, locked, all"
            )),
        }
    }
}

/// Which user, if any, a listing is narrowed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserFilter {
    #[default]
    All,
    AssignedToMe,
    CreatedByMe,
}

impl FromStr for UserFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(UserFilter::All),
            "assigned_to_me" => Ok(UserFilter::AssignedToMe),
            "created_by_me" => Ok(UserFilter::CreatedByMe),
            other => Err(format!(
                "Invalid filter '{other}'. Must be one of: all, assigned_to_me, created_by_me"
            )),
        }
    }
}

/// Query parameters for the merge request listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct MergeRequestQuery {
    pub state: MergeRequestState,
    pub author_id: Option<u64>,
    pub assignee_id: Option<u64>,
}
