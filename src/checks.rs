//! CI check filtering and aggregation.

use serde::Deserialize;

use crate::types::{CheckDetail, CheckState, CheckStatus};

/// Selects which checks count towards the aggregate state.
///
/// When `allow` is non-empty only the named checks count and `deny` is
/// ignored; otherwise every check except those named in `deny` counts.
/// Names match exactly.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CheckFilter {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl CheckFilter {
    pub fn new(allow: Vec<String>, deny: Vec<String>) -> Self {
        Self { allow, deny }
    }

    pub fn matches(&self, name: &str) -> bool {
        if !self.allow.is_empty() {
            return self.allow.iter().any(|n| n == name);
        }
        !self.deny.iter().any(|n| n == name)
    }

    pub fn apply(&self, details: Vec<CheckDetail>) -> Vec<CheckDetail> {
        details.into_iter().filter(|d| self.matches(&d.name)).collect()
    }
}

/// Reduces individual check states to one: any failure or error wins,
/// then any pending, otherwise success. No checks at all is pending.
pub fn aggregate_state(details: &[CheckDetail]) -> CheckState {
    if details.is_empty() {
        return CheckState::Pending;
    }
    if details.iter().any(|d| d.status.is_failed()) {
        CheckState::Failure
    } else if details.iter().any(|d| d.status == CheckState::Pending) {
        CheckState::Pending
    } else {
        CheckState::Success
    }
}

fn describe(details: &[CheckDetail]) -> String {
    if details.is_empty() {
        return "No checks".to_string();
    }

    let total = details.len();
    let failed = details.iter().filter(|d| d.status.is_failed()).count();
    let pending = details
        .iter()
        .filter(|d| d.status == CheckState::Pending)
        .count();
    let passed = total - failed - pending;

    match (failed, pending) {
        (0, 0) => format!("{passed}/{total} checks passed"),
        (0, p) => format!("{p} pending, {passed}/{total} passed"),
        (f, 0) => format!("{f} failing, {passed}/{total} passed"),
        (f, p) => format!("{f} failing, {p} pending"),
    }
}

/// Builds the aggregate [`CheckStatus`] from raw check details after
/// applying `filter`.
pub fn summarize(details: Vec<CheckDetail>, filter: &CheckFilter) -> CheckStatus {
    let details = filter.apply(details);
    CheckStatus {
        state: aggregate_state(&details),
        description: describe(&details),
        details,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn detail(name: &str, status: CheckState) -> CheckDetail {
        CheckDetail {
            name: name.to_string(),
            status,
            description: String::new(),
            url: None,
        }
    }

    #[test]
    fn test_aggregate_failure_wins() {
        let details = [
            detail("a", CheckState::Failure),
            detail("b", CheckState::Success),
        ];
        assert_eq!(aggregate_state(&details), CheckState::Failure);
    }

    #[test]
    fn test_aggregate_error_counts_as_failure() {
        let details = [
            detail("a", CheckState::Pending),
            detail("b", CheckState::Error),
        ];
        assert_eq!(aggregate_state(&details), CheckState::Failure);
    }

    #[test]
    fn test_aggregate_pending_over_success() {
        let details = [
            detail("a", CheckState::Pending),
            detail("b", CheckState::Success),
        ];
        assert_eq!(aggregate_state(&details), CheckState::Pending);
    }

    #[test]
    fn test_aggregate_all_success() {
        assert_eq!(
            aggregate_state(&[detail("a", CheckState::Success)]),
            CheckState::Success
        );
    }

    #[test]
    fn test_aggregate_empty_is_pending() {
        assert_eq!(aggregate_state(&[]), CheckState::Pending);
    }

    #[test]
    fn test_allow_list_takes_precedence() {
        let filter = CheckFilter::new(vec!["build".into()], vec!["build".into()]);
        let status = summarize(
            vec![
                detail("build", CheckState::Success),
                detail("flaky-e2e", CheckState::Failure),
            ],
            &filter,
        );
        assert_eq!(status.state, CheckState::Success);
        assert_eq!(status.details.len(), 1);
        assert_eq!(status.description, "1/1 checks passed");
    }

    #[test]
    fn test_deny_list_ignores_named_checks() {
        let filter = CheckFilter::new(vec![], vec!["flaky-e2e".into()]);
        let status = summarize(
            vec![
                detail("build", CheckState::Success),
                detail("lint", CheckState::Pending),
                detail("flaky-e2e", CheckState::Failure),
            ],
            &filter,
        );
        assert_eq!(status.state, CheckState::Pending);
        assert_eq!(status.description, "1 pending, 1/2 passed");
    }

    #[test]
    fn test_filtered_to_nothing_reports_no_checks() {
        let filter = CheckFilter::new(vec!["missing".into()], vec![]);
        let status = summarize(vec![detail("build", CheckState::Success)], &filter);
        assert_eq!(status.state, CheckState::Pending);
        assert_eq!(status.description, "No checks");
        assert!(status.details.is_empty());
    }
}
