//! Cached, retrying façade over a [`Forge`].
//!
//! Every read is looked up in the cache first and, on a miss, fetched
//! through the shared backoff loop and written back. Mutations go straight
//! to the forge (still retried) and invalidate the cached reads they make
//! stale.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tracing::{debug, info};

use crate::{
    backoff::{self, BackoffPolicy},
    cache::{self, Cache, Cacheable, ForCommit, keys},
    checks::{self, CheckFilter},
    types::{
        CheckStatus, Comment, DiffStats, Forge, MergeMethod, PrKey, PullRequest, Repo, Review,
    },
};

pub struct Gateway {
    forge: Arc<dyn Forge>,
    cache: Arc<dyn Cache>,
    backoff: BackoffPolicy,
    check_filter: CheckFilter,
    ttl: Duration,
}

impl Gateway {
    pub fn new(
        forge: Arc<dyn Forge>,
        cache: Arc<dyn Cache>,
        backoff: BackoffPolicy,
        check_filter: CheckFilter,
        ttl: Duration,
    ) -> Self {
        Self {
            forge,
            cache,
            backoff,
            check_filter,
            ttl,
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    async fn with_retry<T, F, Fut>(&self, label: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        backoff::retry(&self.backoff, label, operation, |err| {
            self.forge.is_transient(err)
        })
        .await
    }

    /// Open, unmerged pull requests matching `query`, served from cache
    /// when possible.
    pub async fn search(&self, query: &str) -> Result<Vec<PullRequest>> {
        let key = keys::search(query);
        if let Some(prs) = cache::load::<Vec<PullRequest>>(self.cache.as_ref(), &key).await {
            return Ok(prs);
        }
        self.search_fresh(query).await
    }

    /// Like [`Gateway::search`] but always asks the forge, then refreshes
    /// the cached result.
    pub async fn search_fresh(&self, query: &str) -> Result<Vec<PullRequest>> {
        let prs: Vec<PullRequest> = self
            .with_retry("search", || self.forge.search_pull_requests(query))
            .await?
            .into_iter()
            .filter(|pr| !pr.merged)
            .collect();

        info!(query, count = prs.len(), "Fetched pull requests");
        cache::store(self.cache.as_ref(), &keys::search(query), &prs, self.ttl).await;
        Ok(prs)
    }

    /// Diff size of `pr` at `head_sha`. Cached entries recorded for any
    /// other head are ignored.
    pub async fn diff_stats(&self, pr: &PrKey, head_sha: &str) -> Result<DiffStats> {
        let key = keys::diff_stats(pr);
        if let Some(stats) = self.load_for_commit(&key, head_sha).await {
            return Ok(stats);
        }
        let stats = self
            .with_retry("diff_stats", || self.forge.diff_stats(pr))
            .await?;
        self.store_for_commit(&key, head_sha, stats).await;
        Ok(stats)
    }

    /// CI summary of `pr` at `head_sha`, after the configured filter.
    pub async fn check_status(&self, pr: &PrKey, head_sha: &str) -> Result<CheckStatus> {
        let key = keys::check_status(pr);
        if let Some(status) = self.load_for_commit(&key, head_sha).await {
            return Ok(status);
        }
        let details = self
            .with_retry("check_status", || self.forge.check_details(pr))
            .await?;
        let status = checks::summarize(details, &self.check_filter);
        self.store_for_commit(&key, head_sha, status.clone()).await;
        Ok(status)
    }

    async fn load_for_commit<T: Cacheable>(&self, key: &str, head_sha: &str) -> Option<T> {
        let entry = cache::load::<ForCommit<T>>(self.cache.as_ref(), key).await?;
        if entry.head_sha != head_sha {
            debug!(key, cached = %entry.head_sha, head_sha, "Cached entry belongs to another head");
            return None;
        }
        Some(entry.value)
    }

    async fn store_for_commit<T: Cacheable>(&self, key: &str, head_sha: &str, value: T) {
        let entry = ForCommit {
            head_sha: head_sha.to_string(),
            value,
        };
        cache::store(self.cache.as_ref(), key, &entry, self.ttl).await;
    }

    pub async fn reviews(&self, pr: &PrKey) -> Result<Vec<Review>> {
        let key = keys::reviews(pr);
        if let Some(reviews) = cache::load(self.cache.as_ref(), &key).await {
            return Ok(reviews);
        }
        let reviews = self
            .with_retry("reviews", || self.forge.reviews(pr))
            .await?;
        cache::store(self.cache.as_ref(), &key, &reviews, self.ttl).await;
        Ok(reviews)
    }

    pub async fn approve(&self, pr: &PullRequest) -> Result<()> {
        let key = pr.key();
        self.with_retry("approve", || self.forge.approve(&key))
            .await?;
        info!(pr = %key, "Approved pull request");
        self.invalidate_all(pr).await;
        Ok(())
    }

    pub async fn merge(&self, pr: &PullRequest, method: MergeMethod) -> Result<()> {
        let key = pr.key();
        self.with_retry("merge", || self.forge.merge(&key, method))
            .await?;
        info!(pr = %key, method = method.as_str(), "Merged pull request");
        self.invalidate_all(pr).await;
        Ok(())
    }

    pub async fn enable_auto_merge(&self, pr: &PullRequest, method: MergeMethod) -> Result<()> {
        let key = pr.key();
        self.with_retry("enable_auto_merge", || {
            self.forge.enable_auto_merge(&key, method)
        })
        .await?;
        info!(pr = %key, method = method.as_str(), "Enabled auto-merge");
        self.invalidate_all(pr).await;
        Ok(())
    }

    /// Drops the entries that depend on the PR's code. Reviews are kept;
    /// the analysis entry misses by itself because its key carries the
    /// head SHA.
    pub async fn invalidate_commit_data(&self, pr: &PrKey) {
        debug!(pr = %pr, "Invalidating commit-dependent cache entries");
        cache::evict(self.cache.as_ref(), &keys::diff_stats(pr)).await;
        cache::evict(self.cache.as_ref(), &keys::check_status(pr)).await;
    }

    /// Drops every cached read for the PR, including the analysis for its
    /// current head.
    pub async fn invalidate_all(&self, pr: &PullRequest) {
        let key = pr.key();
        self.invalidate_commit_data(&key).await;
        cache::evict(self.cache.as_ref(), &keys::reviews(&key)).await;
        cache::evict(self.cache.as_ref(), &keys::analysis(&key, &pr.head_sha)).await;
    }

    pub async fn pr_details(&self, pr: &PrKey) -> Result<serde_json::Value> {
        self.with_retry("pr_details", || self.forge.pr_details(pr))
            .await
    }

    pub async fn pr_diff(&self, pr: &PrKey) -> Result<String> {
        self.with_retry("pr_diff", || self.forge.pr_diff(pr)).await
    }

    pub async fn file_content(
        &self,
        repo: &Repo,
        path: &str,
        git_ref: Option<&str>,
    ) -> Result<String> {
        self.with_retry("file_content", || {
            self.forge.file_content(repo, path, git_ref)
        })
        .await
    }

    pub async fn pr_comments(&self, pr: &PrKey) -> Result<Vec<Comment>> {
        self.with_retry("pr_comments", || self.forge.pr_comments(pr))
            .await
    }
}
