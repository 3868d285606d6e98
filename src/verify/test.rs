//! Automated test verification, one command per affected package.
//!
//! Interface shape mirrors the build verifier; the exact command table is
//! configuration, not logic. Failing output is distilled into a bounded list
//! of error lines for the retry error-context document.

use crate::command::run_shell;
use crate::verify::build::PackageSpec;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Ceiling on extracted error lines per package.
const MAX_ERROR_LINES: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub package: String,
    pub success: bool,
    pub errors: Vec<String>,
    pub output: String,
    pub duration: Duration,
}

/// Runs each package's test command in its own directory.
pub async fn run_tests(
    packages: &[PackageSpec],
    repo: &Path,
    timeout: Duration,
) -> Vec<TestResult> {
    let mut results = Vec::with_capacity(packages.len());
    for pkg in packages {
        tracing::debug!(package = %pkg.name, command = %pkg.test_command, "Running tests");
        let outcome = run_shell(&pkg.test_command, &pkg.work_dir(repo), timeout).await;
        let errors = if outcome.success {
            Vec::new()
        } else {
            extract_error_lines(&outcome.output)
        };
        results.push(TestResult {
            package: pkg.name.clone(),
            success: outcome.success,
            errors,
            output: outcome.output,
            duration: outcome.duration,
        });
    }
    results
}

/// Pulls the lines most likely to explain a failure out of raw test output.
/// Falls back to the tail of the output when nothing matches.
fn extract_error_lines(output: &str) -> Vec<String> {
    let matched: Vec<String> = output
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("error") || lower.contains("failed") || lower.contains("panic")
        })
        .take(MAX_ERROR_LINES)
        .map(str::to_string)
        .collect();
    if !matched.is_empty() {
        return matched;
    }
    output
        .lines()
        .rev()
        .take(MAX_ERROR_LINES)
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pkg(name: &str, test: &str) -> PackageSpec {
        PackageSpec {
            name: name.to_string(),
            prefix: String::new(),
            root: None,
            build_command: "true".to_string(),
            test_command: test.to_string(),
            docker_service: None,
        }
    }

    #[tokio::test]
    async fn test_passing_suite_has_no_errors() {
        let dir = tempdir().unwrap();
        let results = run_tests(
            &[pkg("api", "echo 'all tests passed'")],
            dir.path(),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(results[0].errors.is_empty());
    }

    #[tokio::test]
    async fn test_failing_suite_extracts_error_lines() {
        let dir = tempdir().unwrap();
        let results = run_tests(
            &[pkg(
                "api",
                "echo 'test_login ... ok'; echo 'test_signup FAILED: assertion'; exit 1",
            )],
            dir.path(),
            Duration::from_secs(10),
        )
        .await;
        assert!(!results[0].success);
        assert_eq!(results[0].errors.len(), 1);
        assert!(results[0].errors[0].contains("test_signup"));
    }

    #[test]
    fn test_extract_error_lines_falls_back_to_tail() {
        let output = "line one\nline two\nline three";
        let lines = extract_error_lines(output);
        assert_eq!(lines, vec!["line one", "line two", "line three"]);
    }

    #[test]
    fn test_extract_error_lines_is_bounded() {
        let output = (0..100)
            .map(|i| format!("error {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let lines = extract_error_lines(&output);
        assert_eq!(lines.len(), MAX_ERROR_LINES);
        assert_eq!(lines[0], "error 0");
    }
}
