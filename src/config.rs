//! TOML configuration.
//!
//! Loaded from `--config` or `$XDG_CONFIG_HOME/prtriage/config.toml`; a
//! missing default file means built-in defaults. Secret values may be
//! 1Password references (`op://vault/item/field`), resolved through a
//! [`SecretResolver`].

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::{
    agent::DEFAULT_MAX_ITERATIONS,
    backoff::{BackoffConfig, BackoffPolicies},
    cache::{Cache, NoopCache, SqliteCache},
    checks::CheckFilter,
    enrich::DEFAULT_STAGGER,
    github::get_github_token,
    tools::ToolToggles,
};

pub const DEFAULT_QUERY: &str = "is:pr is:open review-requested:@me";

/// Extra time a tool call gets on top of the GitHub retry budget.
const TOOL_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);

/// Parses durations such as `30s`, `5m`, `2h`, `1d` or `250ms`. A unitless
/// number is taken as minutes.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();

    if let Ok(minutes) = value.parse::<u64>() {
        return Ok(Duration::from_secs(minutes * 60));
    }

    let units: [(&str, u64); 5] = [
        ("ms", 1),
        ("s", 1_000),
        ("m", 60_000),
        ("h", 3_600_000),
        ("d", 86_400_000),
    ];
    for (suffix, millis) in units {
        if let Some(number) = value.strip_suffix(suffix) {
            let number: u64 = number
                .trim()
                .parse()
                .with_context(|| format!("Invalid duration '{value}'"))?;
            return Ok(Duration::from_millis(number.saturating_mul(millis)));
        }
    }

    anyhow::bail!(
        "Invalid duration '{value}'. Supported formats: unitless number (minutes), '250ms', '30s', '5m', '2h', '1d'"
    )
}

fn duration_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn optional_duration_str<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse_duration(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitHubConfig {
    pub token: Option<String>,
    pub query: String,
    pub check_allow: Vec<String>,
    pub check_deny: Vec<String>,
    /// Delay between the enrichment fetches of consecutive PRs.
    #[serde(deserialize_with = "duration_str")]
    pub stagger: Duration,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            query: DEFAULT_QUERY.to_string(),
            check_allow: Vec::new(),
            check_deny: Vec::new(),
            stagger: DEFAULT_STAGGER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AiConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_iterations: usize,
    pub prompt_template: Option<PathBuf>,
    pub tools: ToolToggles,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            prompt_template: None,
            tools: ToolToggles::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    #[serde(deserialize_with = "duration_str")]
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_age: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(deserialize_with = "duration_str")]
    pub github: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub analysis: Duration,
    /// Defaults to the GitHub retry budget plus a margin.
    #[serde(deserialize_with = "optional_duration_str")]
    pub tool: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            github: Duration::from_secs(90),
            analysis: Duration::from_secs(180),
            tool: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub github: GitHubConfig,
    pub ai: AiConfig,
    pub cache: CacheConfig,
    pub timeouts: TimeoutConfig,
    pub backoff: BackoffConfig,
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("prtriage").join("config.toml"))
    }

    /// Loads `path`, or the default location when `path` is `None`. An
    /// explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    debug!("No config file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Replaces secret references with their values.
    pub fn resolve_secrets(&mut self, resolver: &SecretResolver) -> Result<()> {
        if let Some(token) = &self.github.token {
            self.github.token = Some(resolver.resolve(token).context("github.token")?);
        }
        if let Some(key) = &self.ai.api_key {
            self.ai.api_key = Some(resolver.resolve(key).context("ai.api_key")?);
        }
        Ok(())
    }

    /// The configured token, else `GITHUB_TOKEN`, `GH_TOKEN` or
    /// `gh auth token`.
    pub fn github_token(&self) -> Result<String> {
        match self.github.token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => get_github_token(),
        }
    }

    /// The configured key, else `OPENAI_API_KEY`.
    pub fn ai_api_key(&self) -> Option<String> {
        self.ai
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
    }

    pub fn check_filter(&self) -> CheckFilter {
        CheckFilter::new(self.github.check_allow.clone(), self.github.check_deny.clone())
    }

    pub fn backoff_policies(&self) -> BackoffPolicies {
        self.backoff.resolve()
    }

    pub fn tool_timeout(&self) -> Duration {
        self.timeouts.tool.unwrap_or_else(|| {
            self.backoff_policies().github.max_elapsed_time + TOOL_TIMEOUT_MARGIN
        })
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache.path.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("prtriage")
                .join("cache.db")
        })
    }

    /// Opens the configured cache. Falls back to a [`NoopCache`] when
    /// caching is disabled or the database cannot be opened.
    pub fn open_cache(&self) -> Arc<dyn Cache> {
        if !self.cache.enabled {
            return Arc::new(NoopCache);
        }
        let path = self.cache_path();
        match SqliteCache::open(&path) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Caching disabled");
                Arc::new(NoopCache)
            }
        }
    }
}

/// Resolves `op://` secret references with the 1Password CLI, remembering
/// each resolved value for the life of the resolver.
pub struct SecretResolver {
    program: String,
    resolved: Mutex<HashMap<String, String>>,
}

impl Default for SecretResolver {
    fn default() -> Self {
        Self::with_program("op")
    }
}

impl SecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `program` instead of `op`; it is invoked as `program read REF`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_reference(value: &str) -> bool {
        value.trim_start().starts_with("op://")
    }

    /// Returns `value` unchanged unless it is a secret reference.
    pub fn resolve(&self, value: &str) -> Result<String> {
        if !Self::is_reference(value) {
            return Ok(value.to_string());
        }
        let reference = value.trim();

        if let Some(secret) = self.lookup(reference) {
            return Ok(secret);
        }

        let output = Command::new(&self.program)
            .args(["read", reference])
            .output()
            .with_context(|| format!("Failed to run '{} read'", self.program))?;
        if !output.status.success() {
            anyhow::bail!(
                "'{} read {reference}' failed: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let secret = String::from_utf8(output.stdout)
            .context("Secret is not valid UTF-8")?
            .trim()
            .to_string();
        if secret.is_empty() {
            anyhow::bail!("'{} read {reference}' returned an empty value", self.program);
        }

        if let Ok(mut resolved) = self.resolved.lock() {
            resolved.insert(reference.to_string(), secret.clone());
        }
        Ok(secret)
    }

    fn lookup(&self, reference: &str) -> Option<String> {
        self.resolved.lock().ok()?.get(reference).cloned()
    }
}
