//! GitHub GraphQL documents and response conversion.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::types::{CheckDetail, CheckState, DiffStats, PullRequest, Repo, Review};

pub const SEARCH_QUERY: &str = r#"
    query($query: String!, $after: String) {
        search(query: $query, type: ISSUE, first: 50, after: $after) {
            nodes {
                ... on PullRequest {
                    number
                    title
                    url
                    body
                    updatedAt
                    merged
                    headRefOid
                    author {
                        login
                    }
                    repository {
                        name
                        owner {
                            login
                        }
                    }
                }
            }
            pageInfo {
                hasNextPage
                endCursor
            }
        }
    }
"#;

pub const DIFF_STATS_QUERY: &str = r#"
    query($owner: String!, $name: String!, $number: Int!) {
        repository(owner: $owner, name: $name) {
            pullRequest(number: $number) {
                additions
                deletions
                changedFiles
            }
        }
    }
"#;

pub const CHECKS_QUERY: &str = r#"
    query($owner: String!, $name: String!, $number: Int!) {
        repository(owner: $owner, name: $name) {
            pullRequest(number: $number) {
                commits(last: 1) {
                    nodes {
                        commit {
                            statusCheckRollup {
                                contexts(first: 100) {
                                    nodes {
                                        __typename
                                        ... on CheckRun {
                                            name
                                            status
                                            conclusion
                                            title
                                            detailsUrl
                                        }
                                        ... on StatusContext {
                                            context
                                            state
                                            description
                                            targetUrl
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
"#;

pub const REVIEWS_QUERY: &str = r#"
    query($owner: String!, $name: String!, $number: Int!) {
        repository(owner: $owner, name: $name) {
            pullRequest(number: $number) {
                reviews(last: 50) {
                    nodes {
                        state
                        body
                        author {
                            login
                        }
                    }
                }
            }
        }
    }
"#;

pub const NODE_ID_QUERY: &str = r#"
    query($owner: String!, $name: String!, $number: Int!) {
        repository(owner: $owner, name: $name) {
            pullRequest(number: $number) {
                id
            }
        }
    }
"#;

pub const ENABLE_AUTO_MERGE_MUTATION: &str = r#"
    mutation($id: ID!, $method: PullRequestMergeMethod!) {
        enablePullRequestAutoMerge(input: { pullRequestId: $id, mergeMethod: $method }) {
            clientMutationId
        }
    }
"#;

/// Errors reported in the `errors` member of a GraphQL response.
#[derive(Debug)]
pub struct GraphQLErrors(pub Vec<GraphQLErrorMessage>);

impl std::fmt::Display for GraphQLErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<&str> = self.0.iter().map(|e| e.message.as_str()).collect();
        write!(f, "GraphQL error: {}", messages.join("; "))
    }
}

impl std::error::Error for GraphQLErrors {}

impl GraphQLErrors {
    /// Rate limiting and server-side hiccups are worth retrying; schema,
    /// permission and not-found errors are not.
    pub fn is_transient(&self) -> bool {
        self.0.iter().any(|e| {
            matches!(e.error_type.as_deref(), Some("RATE_LIMITED"))
                || e.message.to_lowercase().contains("timeout")
                || e.message.to_lowercase().contains("something went wrong")
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct GraphQLErrorMessage {
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQLErrorMessage>>,
}

impl<T> GraphQLResponse<T> {
    /// Returns the data member, turning reported errors into an
    /// [`GraphQLErrors`] error.
    pub fn into_data(self) -> anyhow::Result<T> {
        match (self.data, self.errors) {
            (_, Some(errors)) if !errors.is_empty() => Err(GraphQLErrors(errors).into()),
            (Some(data), _) => Ok(data),
            (None, _) => anyhow::bail!("GraphQL response contained no data"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchData {
    pub search: SearchResults,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub nodes: Vec<GraphQLPullRequest>,
    pub page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// A search node. Non-PR nodes come back as empty objects, so every field
/// is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphQLPullRequest {
    pub number: Option<u64>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub body: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub merged: bool,
    pub head_ref_oid: Option<String>,
    pub author: Option<GraphQLAuthor>,
    pub repository: Option<GraphQLRepository>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLAuthor {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLRepository {
    pub name: String,
    pub owner: GraphQLAuthor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryData<T> {
    pub repository: Option<PullRequestData<T>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestData<T> {
    pub pull_request: Option<T>,
}

impl<T> RepositoryData<T> {
    pub fn into_pull_request(self) -> anyhow::Result<T> {
        self.repository
            .and_then(|r| r.pull_request)
            .ok_or_else(|| anyhow::anyhow!("pull request not found"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLDiffStats {
    pub additions: u64,
    pub deletions: u64,
    pub changed_files: u64,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLCommits {
    pub commits: Connection<GraphQLCommitNode>,
}

#[derive(Debug, Deserialize)]
pub struct Connection<T> {
    pub nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLCommitNode {
    pub commit: GraphQLCommit,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLCommit {
    pub status_check_rollup: Option<GraphQLStatusCheckRollup>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLStatusCheckRollup {
    pub contexts: Connection<GraphQLStatusContext>,
}

/// Either a `CheckRun` or a `StatusContext`, told apart by `__typename`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphQLStatusContext {
    #[serde(rename = "__typename")]
    pub typename: String,
    // CheckRun fields
    pub name: Option<String>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub title: Option<String>,
    pub details_url: Option<String>,
    // StatusContext fields
    pub context: Option<String>,
    pub state: Option<String>,
    pub description: Option<String>,
    pub target_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLReviews {
    pub reviews: Connection<GraphQLReview>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLReview {
    pub state: String,
    #[serde(default)]
    pub body: String,
    pub author: Option<GraphQLAuthor>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQLNodeId {
    pub id: String,
}

/// Maps a check run's status/conclusion pair onto a [`CheckState`].
/// Anything not yet completed is pending.
pub fn check_run_state(status: Option<&str>, conclusion: Option<&str>) -> CheckState {
    if status.is_some_and(|s| s != "COMPLETED") {
        return CheckState::Pending;
    }
    match conclusion {
        Some("SUCCESS" | "NEUTRAL" | "SKIPPED") => CheckState::Success,
        Some(
            "FAILURE" | "TIMED_OUT" | "CANCELLED" | "STARTUP_FAILURE" | "ACTION_REQUIRED" | "STALE",
        ) => CheckState::Failure,
        _ => CheckState::Pending,
    }
}

/// Maps a commit status context state onto a [`CheckState`].
pub fn status_context_state(state: Option<&str>) -> CheckState {
    match state.map(str::to_uppercase).as_deref() {
        Some("SUCCESS") => CheckState::Success,
        Some("FAILURE") => CheckState::Failure,
        Some("ERROR") => CheckState::Error,
        _ => CheckState::Pending,
    }
}

/// Converts a GraphQL status context into a unified [`CheckDetail`].
pub fn convert_status_context(context: GraphQLStatusContext) -> Option<CheckDetail> {
    match context.typename.as_str() {
        "CheckRun" => {
            let status = check_run_state(context.status.as_deref(), context.conclusion.as_deref());
            let description = context
                .title
                .filter(|t| !t.is_empty())
                .or_else(|| context.conclusion.map(|c| c.to_lowercase()))
                .or_else(|| context.status.map(|s| s.to_lowercase()))
                .unwrap_or_default();
            Some(CheckDetail {
                name: context.name.unwrap_or_else(|| "Unknown Check".to_string()),
                status,
                description,
                url: context.details_url,
            })
        }
        "StatusContext" => Some(CheckDetail {
            name: context
                .context
                .unwrap_or_else(|| "Unknown Status".to_string()),
            status: status_context_state(context.state.as_deref()),
            description: context.description.unwrap_or_default(),
            url: context.target_url,
        }),
        _ => None,
    }
}

pub fn convert_checks(commits: GraphQLCommits) -> Vec<CheckDetail> {
    commits
        .commits
        .nodes
        .into_iter()
        .last()
        .and_then(|node| node.commit.status_check_rollup)
        .map(|rollup| {
            rollup
                .contexts
                .nodes
                .into_iter()
                .filter_map(convert_status_context)
                .collect()
        })
        .unwrap_or_default()
}

pub fn convert_diff_stats(stats: GraphQLDiffStats) -> DiffStats {
    DiffStats {
        additions: stats.additions,
        deletions: stats.deletions,
        files: stats.changed_files,
    }
}

pub fn convert_reviews(reviews: GraphQLReviews) -> Vec<Review> {
    reviews
        .reviews
        .nodes
        .into_iter()
        .map(|review| Review {
            state: review.state,
            user: review
                .author
                .map(|a| a.login)
                .unwrap_or_else(|| "ghost".to_string()),
            body: review.body,
        })
        .collect()
}

/// Converts a search node into a [`PullRequest`]. Returns `None` for
/// nodes that are not pull requests.
pub fn convert_pull_request(node: GraphQLPullRequest) -> Option<PullRequest> {
    let number = node.number?;
    let repository = node.repository?;
    let repo = Repo::new(repository.owner.login, repository.name).ok()?;

    Some(PullRequest {
        repo,
        number,
        title: node.title.unwrap_or_default(),
        url: node.url.unwrap_or_default(),
        author: node
            .author
            .map(|a| a.login)
            .unwrap_or_else(|| "ghost".to_string()),
        body: node.body.unwrap_or_default(),
        updated_at: node.updated_at.unwrap_or_else(Utc::now),
        head_sha: node.head_ref_oid.unwrap_or_default(),
        merged: node.merged,
    })
}
