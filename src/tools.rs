//! Tools the analysis agent can call mid-conversation.
//!
//! The set of tools is closed: each one is a variant of [`Tool`] and
//! exposes a name, a description and a JSON-schema for its arguments.
//! Tools are registered into a [`ToolRegistry`] at startup according to
//! configuration, and the registry caches successful results by a hash of
//! the exact arguments.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures::TryStreamExt;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::RetryTransientMiddleware;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::{
    backoff::BackoffPolicy,
    cache::{self, Cache, keys},
    diff_analysis,
    gateway::Gateway,
    llm::ToolSchema,
    types::{PrKey, Repo},
};

/// Character budget for fetched web pages.
pub const FETCH_URL_MAX_CHARS: usize = 5000;

/// Character budget for diffs returned by the GitHub tool.
pub const DIFF_MAX_CHARS: usize = 20_000;

const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Which tools are offered to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolToggles {
    pub github: bool,
    pub fetch_url: bool,
    pub analyze_diff: bool,
}

impl Default for ToolToggles {
    fn default() -> Self {
        Self {
            github: true,
            fetch_url: false,
            analyze_diff: true,
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{TRUNCATION_MARKER}", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
enum GitHubQuery {
    PrDetails {
        owner: String,
        repo: String,
        number: u64,
    },
    PrDiff {
        owner: String,
        repo: String,
        number: u64,
    },
    FileContent {
        owner: String,
        repo: String,
        path: String,
        #[serde(default, rename = "ref")]
        git_ref: Option<String>,
    },
    PrComments {
        owner: String,
        repo: String,
        number: u64,
    },
}

fn pr_key(owner: &str, repo: &str, number: u64) -> Result<PrKey> {
    Ok(PrKey::new(Repo::new(owner, repo)?, number))
}

/// Reads pull request data through the gateway.
pub struct GitHubQueryTool {
    gateway: Arc<Gateway>,
}

impl GitHubQueryTool {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    async fn execute(&self, args: &Value) -> Result<String> {
        let query: GitHubQuery =
            serde_json::from_value(args.clone()).context("Invalid github_query arguments")?;

        match query {
            GitHubQuery::PrDetails {
                owner,
                repo,
                number,
            } => {
                let details = self
                    .gateway
                    .pr_details(&pr_key(&owner, &repo, number)?)
                    .await?;
                Ok(serde_json::to_string_pretty(&details)?)
            }
            GitHubQuery::PrDiff {
                owner,
                repo,
                number,
            } => {
                let diff = self.gateway.pr_diff(&pr_key(&owner, &repo, number)?).await?;
                Ok(truncate_chars(&diff, DIFF_MAX_CHARS))
            }
            GitHubQuery::FileContent {
                owner,
                repo,
                path,
                git_ref,
            } => {
                let content = self
                    .gateway
                    .file_content(&Repo::new(owner, repo)?, &path, git_ref.as_deref())
                    .await?;
                Ok(truncate_chars(&content, DIFF_MAX_CHARS))
            }
            GitHubQuery::PrComments {
                owner,
                repo,
                number,
            } => {
                let comments = self
                    .gateway
                    .pr_comments(&pr_key(&owner, &repo, number)?)
                    .await?;
                if comments.is_empty() {
                    return Ok("No comments.".to_string());
                }
                Ok(comments
                    .iter()
                    .map(|c| format!("{} ({}):\n{}", c.user, c.created_at.to_rfc3339(), c.body))
                    .collect::<Vec<_>>()
                    .join("\n\n"))
            }
        }
    }
}

/// Fetches a web page, e.g. a CI log linked from a check.
pub struct FetchUrlTool {
    client: ClientWithMiddleware,
    max_chars: usize,
}

impl FetchUrlTool {
    pub fn new(backoff: &BackoffPolicy, timeout: Duration) -> Result<Self> {
        let base_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        let client = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy(
                backoff.to_retry_policy(),
            ))
            .build();
        Ok(Self {
            client,
            max_chars: FETCH_URL_MAX_CHARS,
        })
    }

    async fn execute(&self, args: &Value) -> Result<String> {
        let raw = args
            .get("url")
            .and_then(Value::as_str)
            .context("fetch_url requires a 'url' string")?;
        let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: '{raw}'"))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Only http and https URLs can be fetched, got '{raw}'");
        }

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("HTTP request failed: {e}"))?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {} from {url}", response.status());
        }

        // Read only as much as the budget can use; UTF-8 needs at most
        // four bytes per character.
        let byte_budget = (self.max_chars * 4 + 1) as u64;
        let reader = tokio_util::io::StreamReader::new(Box::pin(
            response.bytes_stream().map_err(std::io::Error::other),
        ));
        let mut bytes = Vec::new();
        reader
            .take(byte_budget)
            .read_to_end(&mut bytes)
            .await
            .context("Failed to read response body")?;

        let text = String::from_utf8_lossy(&bytes);
        Ok(truncate_chars(&text, self.max_chars))
    }
}

/// Summarises a unified diff: touched paths, sensitive areas, line counts.
#[derive(Debug, Default)]
pub struct AnalyzeDiffTool;

impl AnalyzeDiffTool {
    fn execute(&self, args: &Value) -> Result<String> {
        let diff = args
            .get("diff")
            .and_then(Value::as_str)
            .context("analyze_diff requires a 'diff' string")?;
        Ok(serde_json::to_string_pretty(&diff_analysis::analyze(diff))?)
    }
}

pub enum Tool {
    GitHubQuery(GitHubQueryTool),
    FetchUrl(FetchUrlTool),
    AnalyzeDiff(AnalyzeDiffTool),
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::GitHubQuery(_) => "github_query",
            Tool::FetchUrl(_) => "fetch_url",
            Tool::AnalyzeDiff(_) => "analyze_diff",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Tool::GitHubQuery(_) => {
                "Query GitHub for pull request data: details, the full diff, the content of a \
                 file at a given ref, or the discussion comments."
            }
            Tool::FetchUrl(_) => {
                "Fetch a web page over HTTP(S), for example a CI log linked from a check. \
                 The body is truncated to 5000 characters."
            }
            Tool::AnalyzeDiff(_) => {
                "Analyse a unified diff: list modified paths, flag security-sensitive areas \
                 (auth, credentials, CI, migrations, dependencies) and count changed lines."
            }
        }
    }

    pub fn parameters(&self) -> Value {
        match self {
            Tool::GitHubQuery(_) => json!({
                "type": "object",
                "properties": {
                    "operation": {
                        "type": "string",
                        "enum": ["pr_details", "pr_diff", "file_content", "pr_comments"]
                    },
                    "owner": { "type": "string" },
                    "repo": { "type": "string" },
                    "number": { "type": "integer", "description": "Pull request number" },
                    "path": { "type": "string", "description": "File path for file_content" },
                    "ref": { "type": "string", "description": "Git ref for file_content" }
                },
                "required": ["operation", "owner", "repo"]
            }),
            Tool::FetchUrl(_) => json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "http or https URL" }
                },
                "required": ["url"]
            }),
            Tool::AnalyzeDiff(_) => json!({
                "type": "object",
                "properties": {
                    "diff": { "type": "string", "description": "Unified diff text" }
                },
                "required": ["diff"]
            }),
        }
    }

    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }

    /// Arguments that identify a result for caching purposes.
    fn cache_identity(&self, args: &Value) -> Value {
        match self {
            Tool::FetchUrl(_) => json!({ "method": "GET", "url": args.get("url") }),
            _ => args.clone(),
        }
    }

    pub async fn execute(&self, args: &Value) -> Result<String> {
        match self {
            Tool::GitHubQuery(tool) => tool.execute(args).await,
            Tool::FetchUrl(tool) => tool.execute(args).await,
            Tool::AnalyzeDiff(tool) => tool.execute(args),
        }
    }
}

/// Lookup table of the tools enabled for this run.
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Tool>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl ToolRegistry {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self {
            tools: BTreeMap::new(),
            cache,
            ttl,
        }
    }

    /// Registers every tool enabled in `toggles`.
    pub fn standard(
        toggles: ToolToggles,
        gateway: Arc<Gateway>,
        fetch_backoff: &BackoffPolicy,
        fetch_timeout: Duration,
        ttl: Duration,
    ) -> Result<Self> {
        let mut registry = Self::new(gateway.cache().clone(), ttl);
        if toggles.github {
            registry.register(Tool::GitHubQuery(GitHubQueryTool::new(gateway.clone())));
        }
        if toggles.fetch_url {
            registry.register(Tool::FetchUrl(FetchUrlTool::new(
                fetch_backoff,
                fetch_timeout,
            )?));
        }
        if toggles.analyze_diff {
            registry.register(Tool::AnalyzeDiff(AnalyzeDiffTool));
        }
        Ok(registry)
    }

    /// Adds `tool`, replacing any tool of the same name.
    pub fn register(&mut self, tool: Tool) {
        debug!(tool = tool.name(), "Registered tool");
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn list_for_model(&self) -> Vec<ToolSchema> {
        self.tools.values().map(Tool::schema).collect()
    }

    /// Runs the named tool with JSON-encoded `arguments`. Successful
    /// results are cached; errors never are.
    pub async fn call(&self, name: &str, arguments: &str) -> Result<String> {
        let tool = self
            .get(name)
            .with_context(|| format!("Unknown tool '{name}'"))?;
        let args: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments)
                .with_context(|| format!("Invalid JSON arguments for '{name}'"))?
        };

        let key = keys::tool(name, &tool.cache_identity(&args));
        if let Some(result) = cache::load::<String>(self.cache.as_ref(), &key).await {
            return Ok(result);
        }

        let result = tool.execute(&args).await?;
        info!(tool = name, bytes = result.len(), "Tool call succeeded");
        cache::store(self.cache.as_ref(), &key, &result, self.ttl).await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteCache;

    const HOUR: Duration = Duration::from_secs(3600);

    fn registry_with_diff_tool() -> (ToolRegistry, Arc<SqliteCache>) {
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let mut registry = ToolRegistry::new(cache.clone(), HOUR);
        registry.register(Tool::AnalyzeDiff(AnalyzeDiffTool));
        (registry, cache)
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 5), "hello");
        assert_eq!(truncate_chars("héllo", 2), format!("hé{TRUNCATION_MARKER}"));
    }

    #[test]
    fn test_list_for_model_exposes_schemas() {
        let (registry, _) = registry_with_diff_tool();
        let schemas = registry.list_for_model();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "analyze_diff");
        assert_eq!(schemas[0].parameters["required"], json!(["diff"]));
        assert!(registry.get("fetch_url").is_none());
    }

    #[tokio::test]
    async fn test_call_caches_by_arguments() {
        let (registry, cache) = registry_with_diff_tool();
        let args = r#"{"diff":"diff --git a/x.rs b/x.rs\n+fn x() {}\n"}"#;

        let first = registry.call("analyze_diff", args).await.unwrap();
        assert!(first.contains("x.rs"));

        let key = keys::tool(
            "analyze_diff",
            &serde_json::from_str::<Value>(args).unwrap(),
        );
        assert!(cache.row_exists(&key).await.unwrap());
        assert_eq!(registry.call("analyze_diff", args).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_call_rejects_unknown_tool_and_bad_arguments() {
        let (registry, cache) = registry_with_diff_tool();
        assert!(registry.call("rm_rf", "{}").await.is_err());
        assert!(registry.call("analyze_diff", "{not json").await.is_err());
        assert!(registry.call("analyze_diff", "{}").await.is_err());
        assert_eq!(cache.len().await.unwrap(), 0);
    }
}
