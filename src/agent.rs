//! Tool-augmented analysis of a single pull request.
//!
//! The conversation is a small state machine: the model is asked for the
//! next message, any tool calls it makes are executed and their results
//! appended, and the loop repeats until the model answers in plain text
//! or the turn budget runs out.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    cache::{self, Cache, keys},
    llm::{ChatMessage, ChatModel, ToolCall},
    prompt::{AnalysisInput, PromptTemplate, SYSTEM_PROMPT},
    tools::ToolRegistry,
    types::{Analysis, Recommendation},
};

pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_RISK_LEVEL: &str = "MEDIUM";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no final answer after {0} model turns")]
    IterationLimit(usize),
    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),
    #[error("model request failed: {0:#}")]
    Model(anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct AgentSettings {
    /// Upper bound on model turns per analysis.
    pub max_iterations: usize,
    /// Deadline for the whole conversation.
    pub analysis_timeout: Duration,
    /// Deadline for a single tool call.
    pub tool_timeout: Duration,
    /// How long a finished analysis stays cached.
    pub ttl: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            analysis_timeout: Duration::from_secs(180),
            tool_timeout: Duration::from_secs(90),
            ttl: Duration::from_secs(24 * 3600),
        }
    }
}

enum ConversationState {
    Converse,
    ExecuteTools(Vec<ToolCall>),
    Done(String),
}

pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    cache: Arc<dyn Cache>,
    template: PromptTemplate,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Arc<ToolRegistry>,
        cache: Arc<dyn Cache>,
        template: PromptTemplate,
        settings: AgentSettings,
    ) -> Self {
        Self {
            model,
            tools,
            cache,
            template,
            settings,
        }
    }

    /// Returns the analysis for the PR's current head, asking the model
    /// only on a cache miss. Only successful analyses are cached.
    pub async fn analyze(&self, input: &AnalysisInput) -> Result<Analysis, AgentError> {
        let pr = input.pr.key();
        let key = keys::analysis(&pr, &input.pr.head_sha);
        if let Some(analysis) = cache::load::<Analysis>(self.cache.as_ref(), &key).await {
            return Ok(analysis);
        }

        let timeout = self.settings.analysis_timeout;
        let answer = tokio::time::timeout(timeout, self.converse(input))
            .await
            .map_err(|_| AgentError::Timeout(timeout))??;

        let analysis = parse_analysis(&answer);
        info!(
            pr = %pr,
            recommendation = analysis.recommendation.as_str(),
            risk = %analysis.risk_level,
            "Analysis finished"
        );
        cache::store(self.cache.as_ref(), &key, &analysis, self.settings.ttl).await;
        Ok(analysis)
    }

    async fn converse(&self, input: &AnalysisInput) -> Result<String, AgentError> {
        let mut messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(self.template.render(input)),
        ];
        let schemas = self.tools.list_for_model();
        let mut turns = 0;
        let mut state = ConversationState::Converse;

        loop {
            state = match state {
                ConversationState::Converse => {
                    if turns >= self.settings.max_iterations {
                        warn!(pr = %input.pr.key(), turns, "Giving up on analysis");
                        return Err(AgentError::IterationLimit(turns));
                    }
                    turns += 1;

                    let reply = self
                        .model
                        .complete(&messages, &schemas)
                        .await
                        .map_err(AgentError::Model)?;
                    debug!(turn = turns, tool_calls = reply.tool_calls.len(), "Model replied");

                    if reply.tool_calls.is_empty() {
                        ConversationState::Done(reply.content.unwrap_or_default())
                    } else {
                        let calls = reply.tool_calls.clone();
                        messages.push(reply);
                        ConversationState::ExecuteTools(calls)
                    }
                }
                ConversationState::ExecuteTools(calls) => {
                    for call in calls {
                        let output = self.run_tool(&call).await;
                        messages.push(ChatMessage::tool_result(call.id, output));
                    }
                    ConversationState::Converse
                }
                ConversationState::Done(answer) => return Ok(answer),
            };
        }
    }

    /// Runs one tool call. Failures are reported to the model as text.
    async fn run_tool(&self, call: &ToolCall) -> String {
        let name = &call.function.name;
        let timeout = self.settings.tool_timeout;
        match tokio::time::timeout(timeout, self.tools.call(name, &call.function.arguments)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                format!("Error: {e:#}")
            }
            Err(_) => {
                warn!(tool = %name, ?timeout, "Tool call timed out");
                format!("Error: tool '{name}' timed out after {timeout:?}")
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Field {
    Recommendation,
    RiskLevel,
    Reasoning,
}

fn field_of(line: &str) -> Option<(Field, &str)> {
    let line = line.trim_start();
    [
        ("RECOMMENDATION:", Field::Recommendation),
        ("RISK_LEVEL:", Field::RiskLevel),
        ("REASONING:", Field::Reasoning),
    ]
    .into_iter()
    .find_map(|(prefix, field)| line.strip_prefix(prefix).map(|rest| (field, rest.trim())))
}

/// Parses the model's final answer.
///
/// Missing or unrecognised recommendations fall back to `REVIEW` and a
/// missing risk level to `MEDIUM`. The reasoning runs from its prefix to
/// the next field line.
pub fn parse_analysis(text: &str) -> Analysis {
    let mut recommendation = None;
    let mut risk_level = None;
    let mut reasoning: Vec<&str> = Vec::new();
    let mut in_reasoning = false;

    for line in text.lines() {
        match field_of(line) {
            Some((Field::Recommendation, value)) => {
                in_reasoning = false;
                let word = value
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .trim_matches(|c: char| !c.is_ascii_alphabetic() && c != '_');
                recommendation = word.parse::<Recommendation>().ok();
            }
            Some((Field::RiskLevel, value)) => {
                in_reasoning = false;
                if !value.is_empty() {
                    risk_level = Some(value.to_string());
                }
            }
            Some((Field::Reasoning, value)) => {
                in_reasoning = true;
                reasoning.push(value);
            }
            None if in_reasoning => reasoning.push(line),
            None => {}
        }
    }

    Analysis {
        recommendation: recommendation.unwrap_or(Recommendation::Review),
        risk_level: risk_level.unwrap_or_else(|| DEFAULT_RISK_LEVEL.to_string()),
        reasoning: reasoning.join("\n").trim().to_string(),
    }
}
