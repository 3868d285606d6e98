//! Top-level coordinator: walks the execution plan phase by phase, drives the
//! agent and validation pipeline per item, and keeps the checkpoint current.
//!
//! One failing item never aborts its phase; siblings run to completion and
//! the failure is carried into the outcome. The checkpoint is only cleared
//! after a fully successful run, so a partial run always resumes.

use crate::agent::{AgentSession, PromptOptions};
use crate::checkpoint::{CheckpointStore, ExecutionState, InProgressItem};
use crate::pipeline::ValidationPipeline;
use crate::planner::{ExecutionItem, ExecutionPlan};
use crate::tracker::{ItemStatus, TrackerClient};
use crate::workers::{WorkerPool, WorkerStatus};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub id: String,
    pub identifier: String,
    pub success: bool,
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpicOutcome {
    pub epic_id: String,
    pub total_items: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
    pub success: bool,
    pub duration: Duration,
}

pub struct Orchestrator {
    pipeline: Arc<ValidationPipeline>,
    checkpoints: Arc<CheckpointStore>,
    workers: Arc<WorkerPool>,
    agent: Option<Arc<dyn AgentSession>>,
    tracker: Option<Arc<TrackerClient>>,
    working_dir: PathBuf,
    max_concurrent: usize,
    item_timeout: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<ValidationPipeline>,
        checkpoints: Arc<CheckpointStore>,
        workers: Arc<WorkerPool>,
        agent: Option<Arc<dyn AgentSession>>,
        tracker: Option<Arc<TrackerClient>>,
        working_dir: PathBuf,
        max_concurrent: usize,
        item_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            checkpoints,
            workers,
            agent,
            tracker,
            working_dir,
            max_concurrent: max_concurrent.max(1),
            item_timeout,
        }
    }

    /// Executes the plan, fresh or resumed. Resume requires a usable
    /// checkpoint for the same epic; anything else falls back to a fresh run.
    pub async fn run(
        self: &Arc<Self>,
        plan: &ExecutionPlan,
        epic_identifier: &str,
        resume: bool,
    ) -> Result<EpicOutcome> {
        let start = Instant::now();

        let mut done = self.starting_point(plan, epic_identifier, resume)?;
        let session_id = self.start_tracker_session(&plan.epic_id);
        tracing::info!(
            epic = %plan.epic_id,
            phases = plan.phases.len(),
            items = plan.total_items,
            already_done = done.len(),
            "Starting execution"
        );

        // Every phase is walked even on resume; only items recorded as
        // completed are skipped. An item that terminally failed in an earlier
        // run is not in that set and gets re-executed in full.
        let mut outcomes: Vec<ItemOutcome> = Vec::new();
        for (index, phase) in plan.phases.iter().enumerate() {
            self.checkpoints
                .update_with(|s| s.current_phase = index)
                .context("Failed to record phase transition")?;

            let phase_outcomes = if phase.parallel_eligible() {
                self.run_phase_parallel(&phase.items, &done, session_id.as_deref())
                    .await
            } else {
                self.run_phase_sequential(&phase.items, &done, session_id.as_deref())
                    .await
            };

            for outcome in &phase_outcomes {
                if outcome.success {
                    done.insert(outcome.id.clone());
                }
            }
            outcomes.extend(phase_outcomes);
        }

        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| o.identifier.clone())
            .collect();
        let success = failed.is_empty();

        if success {
            self.checkpoints
                .clear()
                .context("Failed to clear checkpoint after successful run")?;
            tracing::info!(epic = %plan.epic_id, "Execution complete; checkpoint cleared");
        } else {
            tracing::warn!(
                epic = %plan.epic_id,
                failed = failed.len(),
                "Execution finished with failures; checkpoint retained for resume"
            );
        }

        Ok(EpicOutcome {
            epic_id: plan.epic_id.clone(),
            total_items: plan.total_items,
            completed: outcomes.iter().filter(|o| o.success && !o.skipped).count(),
            skipped: outcomes.iter().filter(|o| o.skipped).count(),
            failed,
            success,
            duration: start.elapsed(),
        })
    }

    /// Decides between resuming and starting fresh, and ensures a checkpoint
    /// exists either way. Returns the set of item ids already done; anything
    /// outside that set (in-progress at crash time, or terminally failed) is
    /// re-executed in full.
    fn starting_point(
        &self,
        plan: &ExecutionPlan,
        epic_identifier: &str,
        resume: bool,
    ) -> Result<HashSet<String>> {
        if resume {
            match self.checkpoints.load() {
                Ok(state) if state.epic_id == plan.epic_id => {
                    let resume_point = self
                        .checkpoints
                        .find_resume_point()
                        .context("Checkpoint disappeared between load and resume")?;
                    tracing::info!(
                        phase = resume_point.phase_index,
                        completed = resume_point.completed.len(),
                        redo = resume_point.retry.len(),
                        "Resuming from checkpoint"
                    );
                    return Ok(resume_point.completed.into_iter().collect());
                }
                Ok(state) => {
                    tracing::warn!(
                        found = %state.epic_id,
                        wanted = %plan.epic_id,
                        "Checkpoint belongs to a different epic; starting fresh"
                    );
                }
                Err(reason) => {
                    tracing::warn!(%reason, "No usable checkpoint; starting fresh");
                }
            }
        }

        let branch = format!("orchestrator/{}", epic_identifier);
        let mut state =
            ExecutionState::new(&plan.epic_id, epic_identifier, plan.phases.len(), &branch);
        self.checkpoints
            .save(&mut state)
            .context("Failed to write initial checkpoint")?;
        Ok(HashSet::new())
    }

    fn start_tracker_session(&self, epic_id: &str) -> Option<String> {
        let tracker = self.tracker.as_ref()?;
        match tracker.start_session(epic_id) {
            Ok(session_id) => Some(session_id),
            Err(e) => {
                tracing::warn!(error = %e, "Could not start tracker session; reporting disabled");
                None
            }
        }
    }

    async fn run_phase_sequential(
        self: &Arc<Self>,
        items: &[ExecutionItem],
        done: &HashSet<String>,
        session_id: Option<&str>,
    ) -> Vec<ItemOutcome> {
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            outcomes.push(self.execute_item(item, done, session_id).await);
        }
        outcomes
    }

    async fn run_phase_parallel(
        self: &Arc<Self>,
        items: &[ExecutionItem],
        done: &HashSet<String>,
        session_id: Option<&str>,
    ) -> Vec<ItemOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut set: JoinSet<(usize, ItemOutcome)> = JoinSet::new();
        for (position, item) in items.iter().enumerate() {
            let this = Arc::clone(self);
            let item = item.clone();
            let done = done.clone();
            let session_id = session_id.map(str::to_string);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                // Closed only when the semaphore is dropped, which it never is
                // while tasks hold clones.
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let outcome = this
                    .execute_item(&item, &done, session_id.as_deref())
                    .await;
                (position, outcome)
            });
        }

        let mut outcomes: Vec<(usize, ItemOutcome)> = Vec::with_capacity(items.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => outcomes.push(entry),
                Err(e) => tracing::error!(error = %e, "Item task panicked"),
            }
        }
        // Declared order for stable reporting.
        outcomes.sort_by_key(|(position, _)| *position);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// One item end to end: worker registration, tracker reporting, agent
    /// session, validation, checkpoint update. Failures are captured in the
    /// outcome, never propagated, so sibling items keep running.
    async fn execute_item(
        &self,
        item: &ExecutionItem,
        done: &HashSet<String>,
        session_id: Option<&str>,
    ) -> ItemOutcome {
        if done.contains(&item.id) {
            tracing::info!(item = %item.identifier, "Already completed; skipping");
            return ItemOutcome {
                id: item.id.clone(),
                identifier: item.identifier.clone(),
                success: true,
                skipped: true,
            };
        }

        let worker_id = self
            .workers
            .register(&item.id, &item.identifier, None);
        if let Err(e) = self.workers.set_status(&worker_id, WorkerStatus::Working) {
            tracing::warn!(item = %item.identifier, error = %e, "Worker transition rejected");
        }
        self.report(&item.id, ItemStatus::Started, None, session_id);

        if let Err(e) = self.checkpoints.mark_item_in_progress(InProgressItem {
            id: item.id.clone(),
            identifier: item.identifier.clone(),
            worker_id: worker_id.clone(),
            progress: 0,
            branch: None,
        }) {
            tracing::warn!(item = %item.identifier, error = %e, "Could not record in-progress state");
        }

        let success = match self.implement_item(item).await {
            Ok(()) => {
                self.workers.set_progress(&worker_id, "validating");
                self.report(&item.id, ItemStatus::InProgress, Some("validating"), session_id);
                let report = self.pipeline.run(&item.id, &item.identifier).await;
                report.success
            }
            Err(e) => {
                tracing::error!(item = %item.identifier, error = %e, "Agent session failed");
                false
            }
        };

        if success {
            if let Err(e) = self
                .checkpoints
                .mark_item_completed(&item.id, &item.identifier)
            {
                tracing::warn!(item = %item.identifier, error = %e, "Could not record completion");
            }
            let _ = self.workers.set_status(&worker_id, WorkerStatus::Completed);
            self.report(&item.id, ItemStatus::Completed, None, session_id);
            tracing::info!(item = %item.identifier, "Item completed");
        } else {
            if let Err(e) = self
                .checkpoints
                .update_with(|s| s.last_error = Some(format!("{} failed validation", item.identifier)))
            {
                tracing::warn!(item = %item.identifier, error = %e, "Could not record failure");
            }
            let _ = self.workers.set_status(&worker_id, WorkerStatus::Failed);
            self.report(&item.id, ItemStatus::Failed, None, session_id);
            tracing::error!(item = %item.identifier, "Item failed validation");
        }

        // Outcome is recorded; the worker has nothing left to mirror.
        self.workers.remove(&worker_id);

        ItemOutcome {
            id: item.id.clone(),
            identifier: item.identifier.clone(),
            success,
            skipped: false,
        }
    }

    /// Dispatches the item's implementation prompt. Without an agent the item
    /// goes straight to validation (useful for re-validating existing work).
    async fn implement_item(&self, item: &ExecutionItem) -> Result<()> {
        let Some(agent) = &self.agent else {
            tracing::debug!(item = %item.identifier, "No agent configured; validation only");
            return Ok(());
        };
        let prompt = item_prompt(item);
        let options = PromptOptions {
            working_dir: self.working_dir.clone(),
            timeout: self.item_timeout,
        };
        let outcome = agent
            .execute_prompt(&prompt, &options)
            .await
            .with_context(|| format!("Agent session failed for {}", item.identifier))?;
        if outcome.result.trim().is_empty() {
            anyhow::bail!("Agent session produced no output for {}", item.identifier);
        }
        Ok(())
    }

    /// Best-effort tracker reporting; failures are logged and ignored.
    fn report(
        &self,
        item_id: &str,
        status: ItemStatus,
        progress: Option<&str>,
        session_id: Option<&str>,
    ) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        if let Err(e) = tracker.report_status(item_id, status, progress, session_id) {
            tracing::warn!(item = %item_id, error = %e, "Tracker report failed");
        }
    }
}

fn item_prompt(item: &ExecutionItem) -> String {
    format!(
        "Implement the following work item.\n\n\
         Identifier: {}\nTitle: {}\n\n\
         Follow the existing conventions of this repository. When the work is \
         complete, make sure the project builds and its tests pass.",
        item.identifier, item.title,
    )
}
