//! Pattern analysis over unified diffs.
//!
//! Pure text processing: no I/O, and the same diff always produces the
//! same report.

use std::{collections::BTreeSet, sync::LazyLock};

use regex::{Regex, RegexSet};
use serde::Serialize;

static DIFF_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(\S+) b/(\S+)").expect("valid diff header regex"));

/// Path fragments that usually deserve a closer look, with the category
/// reported for each.
static SENSITIVE_PATTERNS: LazyLock<(RegexSet, Vec<&'static str>)> = LazyLock::new(|| {
    let patterns: &[(&str, &str)] = &[
        (r"(?i)auth", "authentication"),
        (r"(?i)(login|session|oauth|saml|sso)", "authentication"),
        (r"(?i)(secret|credential|password|passwd|token|apikey|api_key)", "credentials"),
        (r"(?i)(crypto|cipher|encrypt|tls|ssl|cert)", "cryptography"),
        (r"(?i)(security|permission|rbac|policy|acl)", "access-control"),
        (r"(?i)migrations?/", "database-migration"),
        (r"(?i)\.sql$", "database-migration"),
        (r"^\.github/workflows/", "ci-pipeline"),
        (r"(?i)(jenkinsfile|\.gitlab-ci\.yml|\.circleci/)", "ci-pipeline"),
        (r"(?i)(^|/)dockerfile", "build-image"),
        (r"(?i)(^|/)(go\.mod|go\.sum|cargo\.toml|cargo\.lock|package\.json|package-lock\.json|requirements\.txt|pom\.xml)$", "dependencies"),
        (r"(?i)(^|/)(config|settings)[^/]*\.(ya?ml|json|toml|ini)$", "configuration"),
        (r"(?i)(^|/)(deploy|helm|k8s|kubernetes|terraform)/", "infrastructure"),
    ];
    let set = RegexSet::new(patterns.iter().map(|(p, _)| *p)).expect("valid sensitive path patterns");
    (set, patterns.iter().map(|(_, c)| *c).collect())
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensitivePath {
    pub path: String,
    pub categories: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    pub modified_paths: Vec<String>,
    pub sensitive_paths: Vec<SensitivePath>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// Paths touched by the diff, in first-seen order without duplicates.
pub fn modified_paths(diff: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut paths = Vec::new();
    let mut push = |path: &str| {
        if path != "/dev/null" && seen.insert(path.to_string()) {
            paths.push(path.to_string());
        }
    };

    for line in diff.lines() {
        if let Some(caps) = DIFF_HEADER.captures(line) {
            push(&caps[2]);
        } else if let Some(path) = line.strip_prefix("+++ b/") {
            push(path.trim_end());
        } else if let Some(path) = line.strip_prefix("--- a/") {
            push(path.trim_end());
        }
    }
    paths
}

/// Categories of sensitive-path keywords matching `path`.
pub fn sensitive_categories(path: &str) -> Vec<&'static str> {
    let (set, categories) = &*SENSITIVE_PATTERNS;
    let mut matched: Vec<&'static str> = set.matches(path).iter().map(|i| categories[i]).collect();
    matched.dedup();
    matched
}

pub fn analyze(diff: &str) -> DiffReport {
    let modified_paths = modified_paths(diff);
    let sensitive_paths = modified_paths
        .iter()
        .filter_map(|path| {
            let categories = sensitive_categories(path);
            (!categories.is_empty()).then(|| SensitivePath {
                path: path.clone(),
                categories,
            })
        })
        .collect();

    let (mut lines_added, mut lines_removed) = (0, 0);
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            lines_added += 1;
        } else if line.starts_with('-') {
            lines_removed += 1;
        }
    }

    DiffReport {
        modified_paths,
        sensitive_paths,
        lines_added,
        lines_removed,
    }
}
