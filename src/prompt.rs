//! Prompt rendering for pull request analysis.

use std::path::Path;

use anyhow::{Context, Result};

use crate::types::{CheckStatus, DiffStats, PullRequest, Review};

pub const SYSTEM_PROMPT: &str = "You are a senior engineer triaging pull requests. \
Use the available tools when the summary is not enough to judge the change. \
When you are done, answer in exactly this format:\n\
RECOMMENDATION: APPROVE | REVIEW | DEEP_REVIEW\n\
RISK_LEVEL: LOW | MEDIUM | HIGH\n\
REASONING: one or two short paragraphs";

pub const DEFAULT_TEMPLATE: &str = "\
Assess this pull request.

Title: {{title}}
URL: {{url}}
Author: {{author}}
Size: +{{additions}}/-{{deletions}} across {{files}} files
CI: {{check_state}}
{{checks}}
Reviews:
{{reviews}}

Description:
{{description}}
";

/// Longest description passed to the model, in characters.
const MAX_DESCRIPTION_CHARS: usize = 4000;

/// Everything known about a pull request once its enrichment finished.
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub pr: PullRequest,
    pub diff_stats: DiffStats,
    pub check_status: CheckStatus,
    pub reviews: Vec<Review>,
}

/// A prompt template with `{{name}}` placeholders.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            text: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt template {}", path.display()))?;
        Ok(Self::new(text))
    }

    /// Substitutes every known placeholder. Unknown placeholders are left
    /// as written.
    pub fn render(&self, input: &AnalysisInput) -> String {
        let checks = if input.check_status.details.is_empty() {
            String::new()
        } else {
            input
                .check_status
                .details
                .iter()
                .map(|check| match check.description.as_str() {
                    "" => format!("- {}: {}", check.name, check.status),
                    desc => format!("- {}: {} ({desc})", check.name, check.status),
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let reviews = if input.reviews.is_empty() {
            "No reviews yet.".to_string()
        } else {
            input
                .reviews
                .iter()
                .map(|r| format!("- {} by {}", r.state, r.user))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let description: String = match input.pr.body.trim() {
            "" => "(no description)".to_string(),
            body => body.chars().take(MAX_DESCRIPTION_CHARS).collect(),
        };

        let stats = &input.diff_stats;
        let substitutions = [
            ("title", input.pr.title.clone()),
            ("url", input.pr.url.clone()),
            ("author", input.pr.author.clone()),
            ("additions", stats.additions.to_string()),
            ("deletions", stats.deletions.to_string()),
            ("files", stats.files.to_string()),
            (
                "check_state",
                format!(
                    "{} ({})",
                    input.check_status.state, input.check_status.description
                ),
            ),
            ("checks", checks),
            ("reviews", reviews),
            ("description", description),
        ];

        substitutions
            .iter()
            .fold(self.text.clone(), |text, (name, value)| {
                text.replace(&format!("{{{{{name}}}}}"), value)
            })
    }
}
