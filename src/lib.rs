//! prtriage: triage open pull requests from the terminal.
//!
//! Pulls the PRs matching a GitHub search, enriches each one with its diff
//! size, CI status and reviews, and optionally asks an LLM for a
//! recommendation. Every remote read is retried with backoff and cached in
//! a local SQLite file so repeated runs are fast.

pub mod agent;
pub mod backoff;
pub mod cache;
pub mod checks;
pub mod cli;
pub mod config;
pub mod diff_analysis;
pub mod enrich;
pub mod gateway;
pub mod github;
pub mod graphql;
pub mod llm;
pub mod prompt;
pub mod tools;
pub mod types;

pub use agent::{Agent, AgentError, AgentSettings};
pub use backoff::{BackoffPolicies, BackoffPolicy};
pub use cache::{Cache, CacheError, NoopCache, SqliteCache};
pub use cli::{Action, DisplayMode, Options, parse_args};
pub use config::{Config, SecretResolver};
pub use enrich::{AnalysisState, Board, Command, Enricher, Event, Field, PrState};
pub use gateway::Gateway;
pub use github::GitHub;
pub use llm::{ChatMessage, ChatModel, OpenAiClient, ToolCall, ToolSchema};
pub use prompt::{AnalysisInput, PromptTemplate};
pub use tools::{Tool, ToolRegistry, ToolToggles};
pub use types::{
    Analysis, CheckDetail, CheckState, CheckStatus, Comment, DiffStats, Forge, MergeMethod,
    PrKey, PullRequest, Recommendation, Repo, RepoError, Review,
};
