//! REST client for the tracking backend.
//!
//! Fetching the epic's feature tree is load-bearing (no plan without it);
//! status reporting is best-effort and callers only log failures so a flaky
//! backend never stalls execution.

use crate::planner::FeatureInput;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Started,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
}

pub struct TrackerClient {
    base_url: String,
    agent: ureq::Agent,
}

impl TrackerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            agent: config.into(),
        }
    }

    /// Fetches the epic's features with their child tasks, ready for
    /// plan building.
    pub fn fetch_features(&self, epic_id: &str) -> Result<Vec<FeatureInput>> {
        let url = format!("{}/api/epics/{}/features", self.base_url, epic_id);
        let body = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("Failed to fetch features for epic {}", epic_id))?
            .body_mut()
            .read_to_string()
            .context("Failed to read tracker response")?;
        serde_json::from_str(&body)
            .with_context(|| format!("Tracker returned malformed features for epic {}", epic_id))
    }

    /// Registers a new orchestration session for the epic and returns its id.
    pub fn start_session(&self, epic_id: &str) -> Result<String> {
        let url = format!("{}/api/sessions", self.base_url);
        let payload = json!({ "epic_id": epic_id }).to_string();
        let body = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json")
            .send(payload.as_str())
            .with_context(|| format!("Failed to start session for epic {}", epic_id))?
            .body_mut()
            .read_to_string()
            .context("Failed to read session response")?;
        let response: SessionResponse =
            serde_json::from_str(&body).context("Tracker returned malformed session response")?;
        Ok(response.session_id)
    }

    /// Reports an item status change. Callers treat failures as non-fatal.
    pub fn report_status(
        &self,
        item_id: &str,
        status: ItemStatus,
        progress: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/api/items/{}/status", self.base_url, item_id);
        let payload = json!({
            "status": status,
            "progress": progress,
            "session_id": session_id,
        })
        .to_string();
        self.agent
            .post(&url)
            .header("Content-Type", "application/json")
            .send(payload.as_str())
            .with_context(|| format!("Failed to report status for item {}", item_id))?;
        Ok(())
    }
}
