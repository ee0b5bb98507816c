use std::{fmt, str::FromStr};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Validation errors for repository identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoError {
    EmptyOwner,
    EmptyName,
    InvalidFormat(String),
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoError::EmptyOwner => write!(f, "repository owner cannot be empty"),
            RepoError::EmptyName => write!(f, "repository name cannot be empty"),
            RepoError::InvalidFormat(s) => {
                write!(f, "repository must be in format 'owner/repo', got: '{s}'")
            }
        }
    }
}

impl std::error::Error for RepoError {}

/// A GitHub repository identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Repo {
    owner: String,
    name: String,
}

impl Repo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, RepoError> {
        let owner = owner.into();
        let name = name.into();
        if owner.trim().is_empty() {
            return Err(RepoError::EmptyOwner);
        }
        if name.trim().is_empty() {
            return Err(RepoError::EmptyName);
        }
        Ok(Self { owner, name })
    }

    /// Parses `owner/repo`.
    pub fn parse(s: &str) -> Result<Self, RepoError> {
        match s.trim().split('/').collect::<Vec<_>>().as_slice() {
            [owner, name] => Self::new(*owner, *name),
            _ => Err(RepoError::InvalidFormat(s.to_string())),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Stable identity of a pull request: `owner/repo#number`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrKey {
    pub repo: Repo,
    pub number: u64,
}

impl PrKey {
    pub fn new(repo: Repo, number: u64) -> Self {
        Self { repo, number }
    }

    /// Parses either `owner/repo#123` or a GitHub pull request URL.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if s.starts_with("https://") {
            let url = url::Url::parse(s)?;
            if url.host_str() != Some("github.com") {
                anyhow::bail!("URL must be a GitHub PR URL, got: '{s}'");
            }
            let segments: Vec<&str> = url
                .path_segments()
                .map(|segments| segments.collect())
                .unwrap_or_default();
            let [owner, name, "pull", number, ..] = segments.as_slice() else {
                anyhow::bail!("URL must be in format https://github.com/owner/repo/pull/123, got: '{s}'");
            };
            return Ok(Self::new(Repo::new(*owner, *name)?, number.parse()?));
        }

        let Some((repo, number)) = s.split_once('#') else {
            anyhow::bail!("pull request must be 'owner/repo#123' or a URL, got: '{s}'");
        };
        Ok(Self::new(Repo::parse(repo)?, number.parse()?))
    }
}

impl fmt::Display for PrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// An open pull request as returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub repo: Repo,
    pub number: u64,
    pub title: String,
    pub url: String,
    pub author: String,
    #[serde(default)]
    pub body: String,
    pub updated_at: DateTime<Utc>,
    /// Latest commit on the PR branch. Empty when GitHub did not report
    /// one; refreshed on every search.
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub merged: bool,
}

impl PullRequest {
    pub fn key(&self) -> PrKey {
        PrKey::new(self.repo.clone(), self.number)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub additions: u64,
    pub deletions: u64,
    pub files: u64,
}

/// State of a single check or of the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Success,
    Failure,
    Pending,
    Error,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckState::Success => "success",
            CheckState::Failure => "failure",
            CheckState::Pending => "pending",
            CheckState::Error => "error",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CheckState::Failure | CheckState::Error)
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDetail {
    pub name: String,
    pub status: CheckState,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Aggregated CI state of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub state: CheckState,
    pub description: String,
    #[serde(default)]
    pub details: Vec<CheckDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    /// GitHub review state, e.g. `APPROVED` or `CHANGES_REQUESTED`.
    pub state: String,
    pub user: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub user: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Approve,
    Review,
    DeepReview,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Approve => "APPROVE",
            Recommendation::Review => "REVIEW",
            Recommendation::DeepReview => "DEEP_REVIEW",
        }
    }
}

impl FromStr for Recommendation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "APPROVE" => Ok(Recommendation::Approve),
            "REVIEW" => Ok(Recommendation::Review),
            "DEEP_REVIEW" => Ok(Recommendation::DeepReview),
            other => Err(format!("unknown recommendation: '{other}'")),
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The AI opinion on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub recommendation: Recommendation,
    pub risk_level: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    #[default]
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        }
    }

    /// Upper-case form used by the GraphQL `PullRequestMergeMethod` enum.
    pub fn as_graphql(&self) -> &'static str {
        match self {
            MergeMethod::Merge => "MERGE",
            MergeMethod::Squash => "SQUASH",
            MergeMethod::Rebase => "REBASE",
        }
    }
}

impl FromStr for MergeMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "merge" => Ok(MergeMethod::Merge),
            "squash" => Ok(MergeMethod::Squash),
            "rebase" => Ok(MergeMethod::Rebase),
            other => Err(format!(
                "unknown merge method '{other}' (expected merge, squash or rebase)"
            )),
        }
    }
}

/// Source of pull request data.
///
/// Implemented by [`crate::GitHub`] for the real service and by mocks in
/// tests. Implementations make a single attempt per call; retrying and
/// caching are layered on top by [`crate::Gateway`].
#[async_trait]
pub trait Forge: Send + Sync {
    async fn search_pull_requests(&self, query: &str) -> Result<Vec<PullRequest>>;

    async fn diff_stats(&self, pr: &PrKey) -> Result<DiffStats>;

    async fn check_details(&self, pr: &PrKey) -> Result<Vec<CheckDetail>>;

    async fn reviews(&self, pr: &PrKey) -> Result<Vec<Review>>;

    async fn approve(&self, pr: &PrKey) -> Result<()>;

    async fn merge(&self, pr: &PrKey, method: MergeMethod) -> Result<()>;

    async fn enable_auto_merge(&self, pr: &PrKey, method: MergeMethod) -> Result<()>;

    async fn pr_details(&self, pr: &PrKey) -> Result<serde_json::Value>;

    async fn pr_diff(&self, pr: &PrKey) -> Result<String>;

    async fn file_content(&self, repo: &Repo, path: &str, git_ref: Option<&str>) -> Result<String>;

    async fn pr_comments(&self, pr: &PrKey) -> Result<Vec<Comment>>;

    /// Whether a failed call is worth retrying. Defaults to retrying
    /// everything.
    fn is_transient(&self, _err: &anyhow::Error) -> bool {
        true
    }
}
