//! Text-based blocker classification.
//!
//! Agents and executors report failures as human-readable text. The functions
//! here turn that text into a [`BlockerType`] and a stable signature so retry
//! budgets can count repeats of "the same" failure.

use crate::types::BlockerType;
use regex::Regex;
use std::sync::LazyLock;

/// What the coordinator knows about the report besides its text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockerContext {
    /// A plain status update into BLOCKED.
    #[default]
    StatusUpdate,
    /// The agent explicitly named a prerequisite task.
    DependencyRequest,
    /// Conflict prevention rejected the work.
    ConflictCheck,
}

const DEPENDENCY_PATTERNS: &[&str] = &[
    "waiting on dependencies",
    "waiting for dependencies",
    "waiting on dependency",
    "unmet dependenc",
    "missing dependencies",
    "depends on task",
    "blocked by task",
    "prerequisite",
];

const CONFLICT_PATTERNS: &[&str] = &[
    "conflict",
    "locked by",
    "exclusively locked",
    "lock held",
    "overlaps with",
    "modified by pending task",
];

const ENVIRONMENT_PATTERNS: &[&str] = &[
    "command not found",
    "not installed",
    "no such file or directory",
    "missing toolchain",
    "toolchain",
    "permission denied",
    "environment",
    "network unreachable",
    "connection refused",
    "could not resolve host",
    "executable not found",
];

const ACCEPTANCE_PATTERNS: &[&str] = &[
    "acceptance",
    "criteria not met",
    "validation failed",
    "tests failed",
    "test failed",
    "assertion",
    "review rejected",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "execution failed",
    "executor error",
    "executor failed",
    "parse error",
    "failed to parse",
    "invalid response",
    "empty response",
    "timed out",
    "timeout",
    "rate limit",
    "429",
    "503",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify why a task is blocked.
///
/// The context wins over the text: an explicit dependency request is always a
/// dependency blocker and a conflict-check rejection always a conflict.
pub fn classify_blocker(message: &str, context: BlockerContext) -> BlockerType {
    match context {
        BlockerContext::DependencyRequest => return BlockerType::Dependency,
        BlockerContext::ConflictCheck => return BlockerType::Conflict,
        BlockerContext::StatusUpdate => {}
    }

    let lower = message.to_lowercase();
    if contains_any(&lower, DEPENDENCY_PATTERNS) {
        BlockerType::Dependency
    } else if contains_any(&lower, CONFLICT_PATTERNS) {
        BlockerType::Conflict
    } else if contains_any(&lower, ENVIRONMENT_PATTERNS) {
        BlockerType::Environment
    } else if contains_any(&lower, ACCEPTANCE_PATTERNS) {
        BlockerType::Acceptance
    } else {
        BlockerType::Unknown
    }
}

/// Executor or output-parsing failures that tend to go away on retry.
///
/// Only untyped or `Unknown` blockers qualify. Executor reasons all start
/// with "execution failed", so a typed environment, acceptance or conflict
/// blocker must keep its own release rules.
pub fn is_transient_failure(message: &str, kind: Option<BlockerType>) -> bool {
    matches!(kind, None | Some(BlockerType::Unknown))
        && contains_any(&message.to_lowercase(), TRANSIENT_PATTERNS)
}

/// Text produced when conflict prevention refused an assignment or completion.
pub fn is_conflict_rejection(message: &str) -> bool {
    contains_any(&message.to_lowercase(), CONFLICT_PATTERNS)
}

/// True when a blocker can be cleared by dependency satisfaction alone.
///
/// Untyped blockers count as dependency blockers; typed non-dependency
/// blockers only when their text explicitly says they wait on dependencies.
pub fn is_dependency_attributable(message: Option<&str>, kind: Option<BlockerType>) -> bool {
    match kind {
        None | Some(BlockerType::Dependency) => true,
        Some(_) => message
            .map(|m| contains_any(&m.to_lowercase(), DEPENDENCY_PATTERNS))
            .unwrap_or(false),
    }
}

#[allow(clippy::expect_used)]
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));
#[allow(clippy::expect_used)]
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

const SIGNATURE_LEN: usize = 160;

/// Normalize blocker text so repeats of one failure share a signature.
///
/// Numbers (line numbers, durations, PIDs, timestamps) are masked and
/// whitespace collapsed before truncation.
pub fn blocker_signature(message: &str) -> String {
    let lower = message.trim().to_lowercase();
    let masked = DIGITS.replace_all(&lower, "#");
    let collapsed = WHITESPACE.replace_all(&masked, " ");
    collapsed.chars().take(SIGNATURE_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_messages() {
        assert_eq!(
            classify_blocker("Waiting on dependencies: t-1, t-2", BlockerContext::StatusUpdate),
            BlockerType::Dependency
        );
        assert_eq!(
            classify_blocker("anything at all", BlockerContext::DependencyRequest),
            BlockerType::Dependency
        );
    }

    #[test]
    fn test_conflict_messages() {
        assert_eq!(
            classify_blocker("src/lib.rs is locked by agent-2", BlockerContext::StatusUpdate),
            BlockerType::Conflict
        );
        assert_eq!(
            classify_blocker("rejected", BlockerContext::ConflictCheck),
            BlockerType::Conflict
        );
    }

    #[test]
    fn test_environment_messages() {
        assert_eq!(
            classify_blocker("sh: cargo: command not found", BlockerContext::StatusUpdate),
            BlockerType::Environment
        );
        assert_eq!(
            classify_blocker("Node.js is not installed", BlockerContext::StatusUpdate),
            BlockerType::Environment
        );
    }

    #[test]
    fn test_acceptance_messages() {
        assert_eq!(
            classify_blocker("3 tests failed in suite auth", BlockerContext::StatusUpdate),
            BlockerType::Acceptance
        );
    }

    #[test]
    fn test_unknown_messages() {
        assert_eq!(
            classify_blocker("something odd happened", BlockerContext::StatusUpdate),
            BlockerType::Unknown
        );
        assert_eq!(classify_blocker("", BlockerContext::StatusUpdate), BlockerType::Unknown);
    }

    #[test]
    fn test_transient_failures() {
        let unknown = Some(BlockerType::Unknown);
        assert!(is_transient_failure("Execution failed: executor returned garbage", unknown));
        assert!(is_transient_failure("Failed to parse executor output", None));
        assert!(is_transient_failure("attempt timed out after 1800s", unknown));
        assert!(!is_transient_failure("cargo: command not found", unknown));
    }

    #[test]
    fn test_typed_executor_failures_are_not_transient() {
        let missing_tool = "execution failed: sh exited with status 127: cargo: command not found";
        let kind = classify_blocker(missing_tool, BlockerContext::StatusUpdate);
        assert_eq!(kind, BlockerType::Environment);
        assert!(!is_transient_failure(missing_tool, Some(kind)));

        let failing_tests = "execution failed: make exited with status 2: 4 tests failed";
        let kind = classify_blocker(failing_tests, BlockerContext::StatusUpdate);
        assert_eq!(kind, BlockerType::Acceptance);
        assert!(!is_transient_failure(failing_tests, Some(kind)));
    }

    #[test]
    fn test_dependency_attribution() {
        assert!(is_dependency_attributable(None, None));
        assert!(is_dependency_attributable(Some("x"), Some(BlockerType::Dependency)));
        assert!(is_dependency_attributable(
            Some("waiting on dependencies: a"),
            Some(BlockerType::Unknown)
        ));
        assert!(!is_dependency_attributable(
            Some("docker not installed"),
            Some(BlockerType::Environment)
        ));
        assert!(!is_dependency_attributable(None, Some(BlockerType::Acceptance)));
    }

    #[test]
    fn test_signature_masks_numbers_and_whitespace() {
        let a = blocker_signature("Attempt timed out after 1800s  (pid 4411)");
        let b = blocker_signature("attempt timed out after 30s (pid 12)");
        assert_eq!(a, b);
        assert_eq!(a, "attempt timed out after #s (pid #)");
    }

    #[test]
    fn test_signature_is_truncated() {
        let long = "x".repeat(1000);
        assert_eq!(blocker_signature(&long).len(), SIGNATURE_LEN);
    }
}
