//! Bounded retry-and-rollback control per unit of work.
//!
//! One controller owns the per-unit attempt map (no global state); parallel
//! workers go through its synchronized accessors. A retry is a *dispatch*:
//! it sends a remediation prompt to one agent session and reports whether
//! the session produced output. Correctness is established only by the
//! validation pipeline re-running afterwards.

use crate::agent::{AgentSession, PromptOptions};
use crate::alert::{self, AlertSink, ALERT_MAX_CHARS};
use crate::git_checkpoint::GitCheckpointManager;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default remediation attempts per unit.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Ceiling on one remediation session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryState {
    pub attempts: u32,
    pub last_attempt_succeeded: bool,
    pub last_error: Option<String>,
}

pub struct RetryController {
    max_retries: u32,
    session_timeout: Duration,
    working_dir: PathBuf,
    states: Mutex<HashMap<String, RetryState>>,
    agent: Option<Arc<dyn AgentSession>>,
    git: Arc<GitCheckpointManager>,
    alerts: Arc<dyn AlertSink>,
}

impl RetryController {
    pub fn new(
        working_dir: PathBuf,
        agent: Option<Arc<dyn AgentSession>>,
        git: Arc<GitCheckpointManager>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            working_dir,
            states: Mutex::new(HashMap::new()),
            agent,
            git,
            alerts,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// True until the unit's attempt counter reaches the ceiling.
    pub fn should_retry(&self, unit_id: &str) -> bool {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .get(unit_id)
            .map(|s| s.attempts < self.max_retries)
            .unwrap_or(self.max_retries > 0)
    }

    fn record(&self, unit_id: &str, succeeded: bool, error: Option<String>) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states.entry(unit_id.to_string()).or_default();
        state.last_attempt_succeeded = succeeded;
        state.last_error = error;
    }

    /// Dispatches one remediation attempt. The attempt counter is consumed
    /// up front: an attempt that fails to even start still spends budget.
    /// Returns `Ok(true)` only when the session produced a non-empty result.
    /// A missing agent-session interface is a setup error, not a dispatch
    /// failure.
    pub async fn retry(&self, unit_id: &str, error_context: &str) -> Result<bool> {
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.entry(unit_id.to_string()).or_default().attempts += 1;
        }

        let Some(agent) = self.agent.clone() else {
            self.record(
                unit_id,
                false,
                Some("no agent session interface configured".to_string()),
            );
            anyhow::bail!(
                "Cannot retry unit {}: no agent session interface configured",
                unit_id
            );
        };

        let prompt = remediation_prompt(unit_id, error_context);
        let options = PromptOptions {
            working_dir: self.working_dir.clone(),
            timeout: self.session_timeout,
        };

        tracing::info!(unit = %unit_id, "Dispatching remediation attempt");
        match agent.execute_prompt(&prompt, &options).await {
            Ok(outcome) => {
                let dispatched = !outcome.result.trim().is_empty();
                if dispatched {
                    self.record(unit_id, true, None);
                } else {
                    self.record(unit_id, false, Some("agent session produced no output".to_string()));
                }
                Ok(dispatched)
            }
            Err(e) => {
                tracing::warn!(unit = %unit_id, error = %e, "Remediation dispatch failed");
                self.record(unit_id, false, Some(e.to_string()));
                Ok(false)
            }
        }
    }

    /// Terminal failure handling for a unit: roll the working tree back to
    /// the pre-work checkpoint, then raise an alert. The two steps are
    /// isolated so a rollback failure can never suppress the alert, and an
    /// alert-delivery failure can never be mistaken for a rollback failure.
    pub async fn handle_retry_failure(&self, unit_id: &str, error_summary: &str) {
        match self.git.rollback(unit_id) {
            Ok(tag) => {
                tracing::info!(unit = %unit_id, tag = %tag, "Rolled back to pre-work checkpoint")
            }
            Err(e) => {
                tracing::warn!(unit = %unit_id, error = %e, "Rollback failed; continuing to alert")
            }
        }

        let message = format!(
            "Unit {} failed validation after exhausting its retry budget.\n\n{}",
            unit_id,
            alert::truncate(error_summary, ALERT_MAX_CHARS),
        );
        let alerts = self.alerts.clone();
        let delivery =
            tokio::task::spawn_blocking(move || alerts.send(&message)).await;
        match delivery {
            Ok(Ok(())) => tracing::info!(unit = %unit_id, "Failure alert dispatched"),
            Ok(Err(e)) => tracing::warn!(unit = %unit_id, error = %e, "Alert delivery failed"),
            Err(e) => tracing::warn!(unit = %unit_id, error = %e, "Alert task failed"),
        }
    }

    pub fn get_retry_state(&self, unit_id: &str) -> Option<RetryState> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(unit_id).cloned()
    }

    pub fn reset_retry_state(&self, unit_id: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(unit_id);
    }
}

fn remediation_prompt(unit_id: &str, error_context: &str) -> String {
    format!(
        "Validation failed for work unit {unit_id}. Fix the problems below, \
         keeping changes minimal and focused on making the build, tests and \
         smoke checks pass again.\n\n{error_context}\n\n\
         Do not refactor unrelated code.",
    )
}
