use std::process::Command;

use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::Octocrab;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::{
    graphql::{self, GraphQLErrors, GraphQLResponse, RepositoryData, SearchData},
    types::{
        CheckDetail, Comment, DiffStats, Forge, MergeMethod, PrKey, PullRequest, Repo, Review,
    },
};

/// Safety limit on search pagination.
const MAX_SEARCH_PAGES: usize = 10;

/// Obtains a GitHub token from the environment or the `gh` CLI.
pub fn get_github_token() -> Result<String> {
    // Prefer environment variables over gh CLI to avoid subprocess overhead.
    for var in ["GITHUB_TOKEN", "GH_TOKEN"] {
        if let Ok(token) = std::env::var(var) {
            if !token.trim().is_empty() {
                return Ok(token);
            }
        }
    }

    let output = Command::new("gh")
        .args(["auth", "token"])
        .output()
        .context("Failed to run 'gh auth token'")?;

    if !output.status.success() {
        anyhow::bail!("Failed to get GitHub token from gh CLI. Please run 'gh auth login' first");
    }

    let token = String::from_utf8(output.stdout)?.trim().to_string();
    if token.is_empty() {
        anyhow::bail!("Empty token returned from gh CLI");
    }

    Ok(token)
}

/// [`Forge`] backed by the GitHub GraphQL and REST APIs.
#[derive(Clone)]
pub struct GitHub {
    octocrab: Octocrab,
}

impl GitHub {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let octocrab = Octocrab::builder()
            .personal_token(token.into())
            .build()
            .context("Failed to create GitHub client")?;
        Ok(Self { octocrab })
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let body = json!({ "query": query, "variables": variables });
        let response: GraphQLResponse<T> = self.octocrab.graphql(&body).await?;
        response.into_data()
    }

    async fn pull_request_query<T: DeserializeOwned>(&self, query: &str, pr: &PrKey) -> Result<T> {
        let data: RepositoryData<T> = self
            .graphql(
                query,
                json!({
                    "owner": pr.repo.owner(),
                    "name": pr.repo.name(),
                    "number": pr.number,
                }),
            )
            .await?;
        data.into_pull_request()
            .with_context(|| format!("Failed to load {pr}"))
    }
}

fn pulls_route(pr: &PrKey) -> String {
    format!(
        "/repos/{}/{}/pulls/{}",
        pr.repo.owner(),
        pr.repo.name(),
        pr.number
    )
}

#[async_trait]
impl Forge for GitHub {
    async fn search_pull_requests(&self, query: &str) -> Result<Vec<PullRequest>> {
        let mut prs = Vec::new();
        let mut after: Option<String> = None;

        for page in 1..=MAX_SEARCH_PAGES {
            let data: SearchData = self
                .graphql(
                    graphql::SEARCH_QUERY,
                    json!({ "query": query, "after": after }),
                )
                .await?;
            let results = data.search;
            debug!(page, nodes = results.nodes.len(), "Fetched search page");

            prs.extend(
                results
                    .nodes
                    .into_iter()
                    .filter_map(graphql::convert_pull_request),
            );

            if !results.page_info.has_next_page {
                break;
            }
            after = results.page_info.end_cursor;
            if after.is_none() {
                break;
            }
        }

        Ok(prs)
    }

    async fn diff_stats(&self, pr: &PrKey) -> Result<DiffStats> {
        let stats = self
            .pull_request_query(graphql::DIFF_STATS_QUERY, pr)
            .await?;
        Ok(graphql::convert_diff_stats(stats))
    }

    async fn check_details(&self, pr: &PrKey) -> Result<Vec<CheckDetail>> {
        let commits = self.pull_request_query(graphql::CHECKS_QUERY, pr).await?;
        Ok(graphql::convert_checks(commits))
    }

    async fn reviews(&self, pr: &PrKey) -> Result<Vec<Review>> {
        let reviews = self.pull_request_query(graphql::REVIEWS_QUERY, pr).await?;
        Ok(graphql::convert_reviews(reviews))
    }

    async fn approve(&self, pr: &PrKey) -> Result<()> {
        let _: serde_json::Value = self
            .octocrab
            .post(
                format!("{}/reviews", pulls_route(pr)),
                Some(&json!({ "event": "APPROVE" })),
            )
            .await
            .with_context(|| format!("Failed to approve {pr}"))?;
        Ok(())
    }

    async fn merge(&self, pr: &PrKey, method: MergeMethod) -> Result<()> {
        let _: serde_json::Value = self
            .octocrab
            .put(
                format!("{}/merge", pulls_route(pr)),
                Some(&json!({ "merge_method": method.as_str() })),
            )
            .await
            .with_context(|| format!("Failed to merge {pr}"))?;
        Ok(())
    }

    async fn enable_auto_merge(&self, pr: &PrKey, method: MergeMethod) -> Result<()> {
        let node: graphql::GraphQLNodeId =
            self.pull_request_query(graphql::NODE_ID_QUERY, pr).await?;
        let _: serde_json::Value = self
            .graphql(
                graphql::ENABLE_AUTO_MERGE_MUTATION,
                json!({ "id": node.id, "method": method.as_graphql() }),
            )
            .await
            .with_context(|| format!("Failed to enable auto-merge for {pr}"))?;
        Ok(())
    }

    async fn pr_details(&self, pr: &PrKey) -> Result<serde_json::Value> {
        let details: serde_json::Value = self.octocrab.get(pulls_route(pr), None::<&()>).await?;
        // The full REST payload is mostly URLs; keep what a reviewer reads.
        Ok(json!({
            "title": details["title"],
            "state": details["state"],
            "draft": details["draft"],
            "author": details["user"]["login"],
            "body": details["body"],
            "base": details["base"]["ref"],
            "head": details["head"]["ref"],
            "head_sha": details["head"]["sha"],
            "mergeable": details["mergeable"],
            "mergeable_state": details["mergeable_state"],
            "additions": details["additions"],
            "deletions": details["deletions"],
            "changed_files": details["changed_files"],
            "commits": details["commits"],
            "labels": details["labels"]
                .as_array()
                .map(|labels| labels.iter().map(|l| l["name"].clone()).collect::<Vec<_>>())
                .unwrap_or_default(),
        }))
    }

    async fn pr_diff(&self, pr: &PrKey) -> Result<String> {
        self.octocrab
            .pulls(pr.repo.owner(), pr.repo.name())
            .get_diff(pr.number)
            .await
            .with_context(|| format!("Failed to fetch diff for {pr}"))
    }

    async fn file_content(&self, repo: &Repo, path: &str, git_ref: Option<&str>) -> Result<String> {
        let repos = self.octocrab.repos(repo.owner(), repo.name());
        let mut request = repos.get_content().path(path);
        if let Some(git_ref) = git_ref {
            request = request.r#ref(git_ref);
        }
        let mut contents = request
            .send()
            .await
            .with_context(|| format!("Failed to fetch {path} from {repo}"))?;

        let items = contents.take_items();
        let [item] = items.as_slice() else {
            anyhow::bail!("{path} in {repo} is a directory, not a file");
        };
        item.decoded_content()
            .with_context(|| format!("{path} in {repo} has no decodable content"))
    }

    async fn pr_comments(&self, pr: &PrKey) -> Result<Vec<Comment>> {
        let page = self
            .octocrab
            .issues(pr.repo.owner(), pr.repo.name())
            .list_comments(pr.number)
            .per_page(50)
            .send()
            .await
            .with_context(|| format!("Failed to list comments for {pr}"))?;

        Ok(page
            .items
            .into_iter()
            .map(|comment| Comment {
                user: comment.user.login,
                body: comment.body.unwrap_or_default(),
                created_at: comment.created_at,
            })
            .collect())
    }

    fn is_transient(&self, err: &anyhow::Error) -> bool {
        is_transient_error(err)
    }
}

/// Classifies GitHub failures: rate limits, timeouts and 5xx responses are
/// transient, other 4xx responses are not. Transport errors are retried.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(octocrab::Error::GitHub { source, .. }) = cause.downcast_ref::<octocrab::Error>()
        {
            let status = source.status_code.as_u16();
            return status == 408 || status == 429 || status >= 500;
        }
        if let Some(errors) = cause.downcast_ref::<GraphQLErrors>() {
            return errors.is_transient();
        }
    }
    true
}
