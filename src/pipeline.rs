//! Per-unit validation: build, test and smoke verification with one bounded
//! remediation pass.
//!
//! The pipeline never marks a unit successful without having actually re-run
//! build/test/smoke after remediation; "the agent said it fixed it" is never
//! sufficient on its own.

use crate::alert;
use crate::git_checkpoint::GitCheckpointManager;
use crate::retry::RetryController;
use crate::verify::build::{
    detect_modified_packages, run_builds, run_docker_builds, BuildResult, PackageSpec,
};
use crate::verify::smoke::{run_smoke_tests, SmokeEndpoint, SmokeTestResult};
use crate::verify::test::{run_tests, TestResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ceiling per section of the retry error-context document.
const MAX_SECTION_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Take a git work-checkpoint before validation and clean it up on
    /// success.
    pub git_checkpoints: bool,
    pub smoke_enabled: bool,
    pub base_ref: String,
    pub docker_build_command: String,
    pub build_timeout: Duration,
    pub test_timeout: Duration,
    pub docker_timeout: Duration,
}

/// One full validation run for a unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub unit_id: String,
    pub identifier: String,
    pub success: bool,
    pub build_results: Vec<BuildResult>,
    pub docker_results: Vec<BuildResult>,
    pub test_results: Vec<TestResult>,
    pub smoke: Option<SmokeTestResult>,
    pub retry_attempted: bool,
    pub retry_succeeded: bool,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Results of one verification pass (steps 2-5).
struct VerificationPass {
    build_results: Vec<BuildResult>,
    docker_results: Vec<BuildResult>,
    test_results: Vec<TestResult>,
    smoke: Option<SmokeTestResult>,
}

impl VerificationPass {
    fn passed(&self) -> bool {
        self.build_results.iter().all(|r| r.success)
            && self.docker_results.iter().all(|r| r.success)
            && self.test_results.iter().all(|r| r.success)
            && self.smoke.as_ref().map(|s| s.success).unwrap_or(true)
    }
}

pub struct ValidationPipeline {
    config: PipelineConfig,
    packages: Vec<PackageSpec>,
    endpoints: Vec<SmokeEndpoint>,
    repo: PathBuf,
    git: Arc<GitCheckpointManager>,
    retry: Arc<RetryController>,
}

impl ValidationPipeline {
    pub fn new(
        config: PipelineConfig,
        packages: Vec<PackageSpec>,
        endpoints: Vec<SmokeEndpoint>,
        repo: PathBuf,
        git: Arc<GitCheckpointManager>,
        retry: Arc<RetryController>,
    ) -> Self {
        Self {
            config,
            packages,
            endpoints,
            repo,
            git,
            retry,
        }
    }

    /// Runs the full per-unit validation sequence and produces a structured
    /// report. Verification failures never surface as errors; they drive the
    /// retry/rollback path instead.
    pub async fn run(&self, unit_id: &str, identifier: &str) -> ValidationReport {
        let started_at = Utc::now();
        let start = Instant::now();

        if self.config.git_checkpoints {
            match self.git.create_checkpoint(unit_id) {
                Ok(tag) => tracing::debug!(unit = %unit_id, tag = %tag, "Created work-checkpoint"),
                Err(e) => {
                    tracing::warn!(unit = %unit_id, error = %e, "Could not create work-checkpoint")
                }
            }
        }

        let mut pass = self.verify_once().await;
        let mut success = pass.passed();
        let mut retry_attempted = false;
        let mut retry_succeeded = false;

        if !success && self.retry.should_retry(unit_id) {
            retry_attempted = true;
            let context = error_context(&pass);
            match self.retry.retry(unit_id, &context).await {
                Ok(true) => {
                    retry_succeeded = true;
                    // The agent producing output proves nothing; re-verify
                    // from scratch and recompute.
                    pass = self.verify_once().await;
                    success = pass.passed();
                }
                Ok(false) => {
                    tracing::warn!(unit = %unit_id, "Remediation dispatch did not produce output")
                }
                Err(e) => tracing::warn!(unit = %unit_id, error = %e, "Remediation unavailable"),
            }
        }

        if !success {
            let summary = error_context(&pass);
            self.retry.handle_retry_failure(unit_id, &summary).await;
        } else if self.config.git_checkpoints {
            match self.git.cleanup_checkpoints(unit_id) {
                Ok(removed) => {
                    tracing::debug!(unit = %unit_id, removed, "Cleaned up work-checkpoints")
                }
                Err(e) => {
                    tracing::warn!(unit = %unit_id, error = %e, "Work-checkpoint cleanup failed")
                }
            }
        }

        ValidationReport {
            unit_id: unit_id.to_string(),
            identifier: identifier.to_string(),
            success,
            build_results: pass.build_results,
            docker_results: pass.docker_results,
            test_results: pass.test_results,
            smoke: pass.smoke,
            retry_attempted,
            retry_succeeded,
            started_at,
            duration: start.elapsed(),
        }
    }

    /// Steps 2-5: detect affected packages, build, docker build, test,
    /// smoke. Run in full both initially and after remediation.
    async fn verify_once(&self) -> VerificationPass {
        let affected = match detect_modified_packages(&self.repo, &self.config.base_ref, &self.packages)
        {
            Ok(affected) => affected,
            Err(e) => {
                // Without a diff the safe scope is everything.
                tracing::warn!(error = %e, "Modified-package detection failed; verifying all packages");
                self.packages.clone()
            }
        };
        tracing::info!(
            affected = affected.len(),
            of = self.packages.len(),
            "Verifying affected packages"
        );

        let build_results = run_builds(&affected, &self.repo, self.config.build_timeout).await;
        let docker_results = run_docker_builds(
            &affected,
            &self.repo,
            &self.config.docker_build_command,
            self.config.docker_timeout,
        )
        .await;
        let test_results = run_tests(&affected, &self.repo, self.config.test_timeout).await;

        let smoke = if self.config.smoke_enabled && !self.endpoints.is_empty() {
            Some(run_smoke_tests(&self.endpoints).await)
        } else {
            None
        };

        VerificationPass {
            build_results,
            docker_results,
            test_results,
            smoke,
        }
    }
}

/// Bounded error-context document handed to the remediation session: one
/// truncated section per failing verifier.
fn error_context(pass: &VerificationPass) -> String {
    let mut sections = Vec::new();

    let build_failures: Vec<String> = pass
        .build_results
        .iter()
        .chain(pass.docker_results.iter())
        .filter(|r| !r.success)
        .map(|r| format!("## {}\n{}", r.package, r.output))
        .collect();
    if !build_failures.is_empty() {
        sections.push(format!(
            "# Build failures\n{}",
            alert::truncate(&build_failures.join("\n"), MAX_SECTION_CHARS)
        ));
    }

    let test_failures: Vec<String> = pass
        .test_results
        .iter()
        .filter(|r| !r.success)
        .map(|r| format!("## {}\n{}", r.package, r.errors.join("\n")))
        .collect();
    if !test_failures.is_empty() {
        sections.push(format!(
            "# Test failures\n{}",
            alert::truncate(&test_failures.join("\n"), MAX_SECTION_CHARS)
        ));
    }

    if let Some(smoke) = &pass.smoke {
        let smoke_failures: Vec<String> = smoke
            .checks
            .iter()
            .filter(|c| !c.success)
            .map(|c| c.output.clone())
            .collect();
        if !smoke_failures.is_empty() {
            sections.push(format!(
                "# Smoke-test failures\n{}",
                alert::truncate(&smoke_failures.join("\n"), MAX_SECTION_CHARS)
            ));
        }
    }

    if sections.is_empty() {
        "All verifications passed.".to_string()
    } else {
        sections.join("\n\n")
    }
}
