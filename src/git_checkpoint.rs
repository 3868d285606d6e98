//! Git work-checkpoints: per-unit snapshots taken before risky work, used to
//! roll the working tree back when a unit terminally fails.
//!
//! Checkpoints are lightweight tags named
//! `<prefix>/<unit>/<timestamp>-<nonce>`; the timestamp prefix makes the
//! newest tag for a unit sort last.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Command;
use uuid::Uuid;

pub const DEFAULT_TAG_PREFIX: &str = "pre-work";

pub struct GitCheckpointManager {
    repo_dir: PathBuf,
    tag_prefix: String,
}

impl GitCheckpointManager {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
        }
    }

    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = prefix.into();
        self
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .current_dir(&self.repo_dir)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        if !output.status.success() {
            anyhow::bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn unit_pattern(&self, unit_id: &str) -> String {
        format!("{}/{}/*", self.tag_prefix, sanitize(unit_id))
    }

    fn list_tags(&self, unit_id: &str) -> Result<Vec<String>> {
        let pattern = self.unit_pattern(unit_id);
        let stdout = self.git_ok(&["tag", "--list", &pattern])?;
        let mut tags: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// Tags the current HEAD as the pre-work snapshot for a unit and returns
    /// the tag name.
    pub fn create_checkpoint(&self, unit_id: &str) -> Result<String> {
        let nonce = Uuid::new_v4().simple().to_string();
        let tag = format!(
            "{}/{}/{}-{}",
            self.tag_prefix,
            sanitize(unit_id),
            Utc::now().format("%Y%m%d%H%M%S"),
            &nonce[..8],
        );
        self.git_ok(&["tag", &tag])
            .with_context(|| format!("Failed to create work-checkpoint for unit {}", unit_id))?;
        Ok(tag)
    }

    /// Restores the working tree to the most recent checkpoint for a unit and
    /// returns the tag restored to. Callers treat a failure here as loggable
    /// but non-fatal.
    pub fn rollback(&self, unit_id: &str) -> Result<String> {
        let tags = self.list_tags(unit_id)?;
        let tag = tags
            .last()
            .with_context(|| format!("No work-checkpoint found for unit {}", unit_id))?;
        self.git_ok(&["reset", "--hard", tag.as_str()])
            .with_context(|| format!("Failed to roll back unit {} to {}", unit_id, tag))?;
        Ok(tag.clone())
    }

    /// Deletes the accumulated checkpoint tags for a unit once its work is
    /// confirmed good, bounding tag growth across long orchestration runs.
    /// Returns the number of tags removed; individual deletion failures are
    /// skipped.
    pub fn cleanup_checkpoints(&self, unit_id: &str) -> Result<usize> {
        let tags = self.list_tags(unit_id)?;
        let mut removed = 0;
        for tag in &tags {
            if self.git_ok(&["tag", "-d", tag.as_str()]).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remaining checkpoint tags for a unit.
    pub fn checkpoint_count(&self, unit_id: &str) -> Result<usize> {
        Ok(self.list_tags(unit_id)?.len())
    }
}

/// Tag components must be ref-safe; anything else becomes a dash.
fn sanitize(unit_id: &str) -> String {
    unit_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}
