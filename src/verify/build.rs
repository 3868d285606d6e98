//! Build verification scoped to what actually changed.
//!
//! `detect_modified_packages` diffs the working tree against a base reference
//! and maps changed paths onto the configured package table by prefix match,
//! so only affected packages are rebuilt. Build commands run in each
//! package's own directory with combined output captured; failures are data,
//! not errors.

use crate::command::{run_shell, CommandOutcome};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Diff base used when none is configured: one commit back.
pub const DEFAULT_BASE_REF: &str = "HEAD~1";

/// Placeholder in the docker build command template replaced by the
/// package's service name.
pub const SERVICE_PLACEHOLDER: &str = "{service}";

/// One entry in the fixed package table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Package name used in results and reports.
    pub name: String,
    /// Repo-relative path prefix that maps changed files to this package.
    pub prefix: String,
    /// Directory the build/test commands run in; defaults to the prefix.
    #[serde(default)]
    pub root: Option<PathBuf>,
    pub build_command: String,
    pub test_command: String,
    /// Deployable service name; packages without one are silently skipped by
    /// docker builds.
    #[serde(default)]
    pub docker_service: Option<String>,
}

impl PackageSpec {
    pub fn work_dir(&self, repo: &Path) -> PathBuf {
        match &self.root {
            Some(root) => repo.join(root),
            None => repo.join(&self.prefix),
        }
    }
}

/// Per-package build outcome: subject, success flag, captured output,
/// wall-clock duration.
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub package: String,
    pub success: bool,
    pub output: String,
    pub duration: Duration,
}

impl BuildResult {
    fn from_outcome(package: &str, outcome: CommandOutcome) -> Self {
        Self {
            package: package.to_string(),
            success: outcome.success,
            output: outcome.output,
            duration: outcome.duration,
        }
    }
}

/// Lists files changed since `base_ref` and returns the subset of the
/// package table they touch, preserving table order.
pub fn detect_modified_packages(
    repo: &Path,
    base_ref: &str,
    packages: &[PackageSpec],
) -> Result<Vec<PackageSpec>> {
    let output = Command::new("git")
        .current_dir(repo)
        .args(["diff", "--name-only", base_ref])
        .output()
        .context("Failed to run git diff")?;
    if !output.status.success() {
        anyhow::bail!(
            "git diff --name-only {} failed: {}",
            base_ref,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let changed: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    let affected = packages
        .iter()
        .filter(|pkg| changed.iter().any(|path| path.starts_with(&pkg.prefix)))
        .cloned()
        .collect();
    Ok(affected)
}

/// Runs each package's build command in its own directory.
pub async fn run_builds(
    packages: &[PackageSpec],
    repo: &Path,
    timeout: Duration,
) -> Vec<BuildResult> {
    let mut results = Vec::with_capacity(packages.len());
    for pkg in packages {
        tracing::debug!(package = %pkg.name, command = %pkg.build_command, "Running build");
        let outcome = run_shell(&pkg.build_command, &pkg.work_dir(repo), timeout).await;
        results.push(BuildResult::from_outcome(&pkg.name, outcome));
    }
    results
}

/// Runs the docker build for every package that maps to a deployable
/// service. Packages without a service name are skipped, not failed.
pub async fn run_docker_builds(
    packages: &[PackageSpec],
    repo: &Path,
    command_template: &str,
    timeout: Duration,
) -> Vec<BuildResult> {
    let mut results = Vec::new();
    for pkg in packages {
        let Some(service) = &pkg.docker_service else {
            continue;
        };
        let command_line = command_template.replace(SERVICE_PLACEHOLDER, service);
        tracing::debug!(package = %pkg.name, service = %service, "Running docker build");
        let outcome = run_shell(&command_line, repo, timeout).await;
        results.push(BuildResult::from_outcome(&pkg.name, outcome));
    }
    results
}
