#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use prtriage::{
    Agent, AgentSettings, CheckDetail, CheckState, ChatMessage, ChatModel, Comment, DiffStats,
    Forge, Gateway, MergeMethod, PrKey, PromptTemplate, PullRequest, Repo, Review, Tool,
    ToolRegistry, ToolSchema,
    backoff::BackoffPolicy,
    cache::Cache,
    checks::CheckFilter,
    tools::{AnalyzeDiffTool, GitHubQueryTool},
};

pub const HOUR: Duration = Duration::from_secs(3600);

pub fn repo() -> Repo {
    Repo::new("acme", "widgets").unwrap()
}

pub fn key(number: u64) -> PrKey {
    PrKey::new(repo(), number)
}

pub fn pr(number: u64, head_sha: &str) -> PullRequest {
    PullRequest {
        repo: repo(),
        number,
        title: format!("Change {number}"),
        url: format!("https://github.com/acme/widgets/pull/{number}"),
        author: "alice".to_string(),
        body: "Fixes a bug.".to_string(),
        updated_at: Utc::now(),
        head_sha: head_sha.to_string(),
        merged: false,
    }
}

/// How an injected failure behaves.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Fails this many times, then succeeds. Retryable.
    Transient(usize),
    /// Always fails. Not retryable.
    Permanent,
}

/// In-memory [`Forge`] with call counting and failure injection.
#[derive(Default)]
pub struct MockForge {
    prs: Mutex<Vec<PullRequest>>,
    failures: Mutex<HashMap<(&'static str, u64), Failure>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    diffs: Mutex<HashMap<u64, DiffStats>>,
    stalls: Mutex<HashMap<(&'static str, u64), Duration>>,
    finished: Mutex<Vec<(&'static str, u64)>>,
}

impl MockForge {
    pub fn new(prs: Vec<PullRequest>) -> Arc<Self> {
        Arc::new(Self {
            prs: Mutex::new(prs),
            ..Default::default()
        })
    }

    pub fn set_prs(&self, prs: Vec<PullRequest>) {
        *self.prs.lock().unwrap() = prs;
    }

    /// Injects a failure for `operation` on PR `number` (0 for search).
    pub fn fail(&self, operation: &'static str, number: u64, failure: Failure) {
        self.failures
            .lock()
            .unwrap()
            .insert((operation, number), failure);
    }

    /// Overrides the diff stats returned for PR `number`.
    pub fn set_diff(&self, number: u64, stats: DiffStats) {
        self.diffs.lock().unwrap().insert(number, stats);
    }

    /// Makes the next `operation` on PR `number` take `delay` before it
    /// returns. The result is decided before the wait.
    pub fn stall_once(&self, operation: &'static str, number: u64, delay: Duration) {
        self.stalls
            .lock()
            .unwrap()
            .insert((operation, number), delay);
    }

    /// Successful calls in the order they returned.
    pub fn finished(&self) -> Vec<(&'static str, u64)> {
        self.finished.lock().unwrap().clone()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    fn record(&self, operation: &'static str, number: u64) -> Result<()> {
        *self.calls.lock().unwrap().entry(operation).or_default() += 1;

        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&(operation, number)) {
            Some(Failure::Permanent) => anyhow::bail!("permanent {operation} failure"),
            Some(Failure::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                anyhow::bail!("transient {operation} failure")
            }
            _ => Ok(()),
        }
    }

    async fn finish(&self, operation: &'static str, number: u64) {
        let stall = self.stalls.lock().unwrap().remove(&(operation, number));
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        self.finished.lock().unwrap().push((operation, number));
    }
}

#[async_trait]
impl Forge for MockForge {
    async fn search_pull_requests(&self, _query: &str) -> Result<Vec<PullRequest>> {
        self.record("search", 0)?;
        Ok(self.prs.lock().unwrap().clone())
    }

    async fn diff_stats(&self, pr: &PrKey) -> Result<DiffStats> {
        self.record("diff_stats", pr.number)?;
        let stats = self
            .diffs
            .lock()
            .unwrap()
            .get(&pr.number)
            .copied()
            .unwrap_or(DiffStats {
                additions: pr.number * 10,
                deletions: pr.number,
                files: 2,
            });
        self.finish("diff_stats", pr.number).await;
        Ok(stats)
    }

    async fn check_details(&self, pr: &PrKey) -> Result<Vec<CheckDetail>> {
        self.record("check_details", pr.number)?;
        Ok(vec![
            CheckDetail {
                name: "build".to_string(),
                status: CheckState::Success,
                description: String::new(),
                url: None,
            },
            CheckDetail {
                name: "flaky-e2e".to_string(),
                status: CheckState::Failure,
                description: "timed out".to_string(),
                url: Some("https://ci.example.com/run/1".to_string()),
            },
        ])
    }

    async fn reviews(&self, pr: &PrKey) -> Result<Vec<Review>> {
        self.record("reviews", pr.number)?;
        Ok(vec![Review {
            state: "COMMENTED".to_string(),
            user: "bob".to_string(),
            body: "looks fine".to_string(),
        }])
    }

    async fn approve(&self, pr: &PrKey) -> Result<()> {
        self.record("approve", pr.number)
    }

    async fn merge(&self, pr: &PrKey, _method: MergeMethod) -> Result<()> {
        self.record("merge", pr.number)
    }

    async fn enable_auto_merge(&self, pr: &PrKey, _method: MergeMethod) -> Result<()> {
        self.record("enable_auto_merge", pr.number)
    }

    async fn pr_details(&self, pr: &PrKey) -> Result<serde_json::Value> {
        self.record("pr_details", pr.number)?;
        self.finish("pr_details", pr.number).await;
        Ok(serde_json::json!({ "title": format!("Change {}", pr.number) }))
    }

    async fn pr_diff(&self, pr: &PrKey) -> Result<String> {
        self.record("pr_diff", pr.number)?;
        self.finish("pr_diff", pr.number).await;
        Ok("diff --git a/src/auth.rs b/src/auth.rs\n+fn check() {}\n".to_string())
    }

    async fn file_content(&self, _repo: &Repo, path: &str, _git_ref: Option<&str>) -> Result<String> {
        self.record("file_content", 0)?;
        Ok(format!("contents of {path}"))
    }

    async fn pr_comments(&self, pr: &PrKey) -> Result<Vec<Comment>> {
        self.record("pr_comments", pr.number)?;
        Ok(vec![])
    }

    fn is_transient(&self, err: &anyhow::Error) -> bool {
        err.to_string().contains("transient")
    }
}

pub fn gateway(forge: Arc<MockForge>, cache: Arc<dyn Cache>) -> Arc<Gateway> {
    Arc::new(Gateway::new(
        forge,
        cache,
        BackoffPolicy::no_retry(),
        CheckFilter::new(vec![], vec!["flaky-e2e".to_string()]),
        HOUR,
    ))
}

/// A [`ChatModel`] that replays canned replies and records every request.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ChatMessage>>,
    /// Returned once `replies` runs out.
    fallback: Option<ChatMessage>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    tools_offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ChatMessage>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    /// Answers every request with `reply`.
    pub fn always(reply: ChatMessage) -> Arc<Self> {
        Arc::new(Self {
            fallback: Some(reply),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> Vec<ChatMessage> {
        self.requests.lock().unwrap()[index].clone()
    }

    pub fn tools_offered(&self, index: usize) -> Vec<String> {
        self.tools_offered.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Result<ChatMessage> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.tools_offered
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());

        let next = self.replies.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow::anyhow!("model script exhausted"))
    }
}

pub const FINAL_ANSWER: &str =
    "RECOMMENDATION: APPROVE\nRISK_LEVEL: LOW\nREASONING: Small, well-tested change.";

pub fn settings() -> AgentSettings {
    AgentSettings {
        max_iterations: 3,
        analysis_timeout: Duration::from_secs(10),
        tool_timeout: Duration::from_secs(5),
        ttl: HOUR,
    }
}

pub fn agent(model: Arc<ScriptedModel>, cache: Arc<dyn Cache>) -> Arc<Agent> {
    let mut tools = ToolRegistry::new(cache.clone(), HOUR);
    tools.register(Tool::AnalyzeDiff(AnalyzeDiffTool));
    agent_with(model, tools, cache)
}

/// An agent that can also query `forge` through the `github_query` tool.
pub fn agent_with_github(
    model: Arc<ScriptedModel>,
    cache: Arc<dyn Cache>,
    forge: Arc<MockForge>,
) -> Arc<Agent> {
    let mut tools = ToolRegistry::new(cache.clone(), HOUR);
    tools.register(Tool::GitHubQuery(GitHubQueryTool::new(gateway(
        forge,
        cache.clone(),
    ))));
    tools.register(Tool::AnalyzeDiff(AnalyzeDiffTool));
    agent_with(model, tools, cache)
}

fn agent_with(
    model: Arc<ScriptedModel>,
    tools: ToolRegistry,
    cache: Arc<dyn Cache>,
) -> Arc<Agent> {
    Arc::new(Agent::new(
        model,
        Arc::new(tools),
        cache,
        PromptTemplate::default(),
        settings(),
    ))
}
