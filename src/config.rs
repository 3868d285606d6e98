//! Orchestrator configuration loaded from a YAML file.
//!
//! Everything has a sensible default so a minimal file (or none at all for
//! plan-only commands) still yields a usable configuration.

use crate::verify::build::{PackageSpec, DEFAULT_BASE_REF};
use crate::verify::smoke::SmokeEndpoint;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_max_retries() -> u32 {
    crate::retry::DEFAULT_MAX_RETRIES
}

fn default_session_timeout_secs() -> u64 {
    600
}

fn default_build_timeout_secs() -> u64 {
    600
}

fn default_test_timeout_secs() -> u64 {
    900
}

fn default_docker_timeout_secs() -> u64 {
    900
}

fn default_item_timeout_secs() -> u64 {
    3600
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".orchestrator/checkpoint.json")
}

fn default_max_age_hours() -> i64 {
    crate::checkpoint::DEFAULT_MAX_AGE_HOURS
}

fn default_true() -> bool {
    true
}

fn default_tag_prefix() -> String {
    "pre-work".to_string()
}

fn default_base_ref() -> String {
    DEFAULT_BASE_REF.to_string()
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_docker_build_command() -> String {
    "docker compose build {service}".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_build_timeout_secs")]
    pub build_secs: u64,
    #[serde(default = "default_test_timeout_secs")]
    pub test_secs: u64,
    #[serde(default = "default_docker_timeout_secs")]
    pub docker_secs: u64,
    /// Ceiling on one item's agent session.
    #[serde(default = "default_item_timeout_secs")]
    pub item_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            build_secs: default_build_timeout_secs(),
            test_secs: default_test_timeout_secs(),
            docker_secs: default_docker_timeout_secs(),
            item_secs: default_item_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            max_age_hours: default_max_age_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_true")]
    pub checkpoints_enabled: bool,
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    #[serde(default = "default_base_ref")]
    pub base_ref: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            checkpoints_enabled: true,
            tag_prefix: default_tag_prefix(),
            base_ref: default_base_ref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
    #[serde(default)]
    pub smoke_endpoints: Vec<SmokeEndpoint>,
    #[serde(default)]
    pub smoke_enabled: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Tracking-backend base URL; plan JSON files work without one.
    #[serde(default)]
    pub tracker_url: Option<String>,
    /// Alert webhook; alerts fall back to the log when unset.
    #[serde(default)]
    pub alert_webhook: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_docker_build_command")]
    pub docker_build_command: String,
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Loads the file when it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file; using defaults");
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_gets_defaults() {
        let config: OrchestratorConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.session_timeout_secs, 600);
        assert_eq!(config.checkpoint.max_age_hours, 24);
        assert_eq!(
            config.checkpoint.path,
            PathBuf::from(".orchestrator/checkpoint.json")
        );
        assert!(config.git.checkpoints_enabled);
        assert_eq!(config.git.base_ref, "HEAD~1");
        assert_eq!(config.max_concurrent, 4);
        assert!(!config.smoke_enabled);
        assert!(config.packages.is_empty());
        assert!(config.tracker_url.is_none());
    }

    #[test]
    fn test_partial_sections_keep_remaining_defaults() {
        let yaml = r#"
retry:
  max_retries: 3
git:
  checkpoints_enabled: false
packages:
  - name: api
    prefix: services/api
    build_command: "go build ./..."
    test_command: "go test ./..."
    docker_service: api
"#;
        let config: OrchestratorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.session_timeout_secs, 600);
        assert!(!config.git.checkpoints_enabled);
        assert_eq!(config.git.tag_prefix, "pre-work");
        assert_eq!(config.packages.len(), 1);
        assert_eq!(config.packages[0].docker_service.as_deref(), Some("api"));
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orchestrate.yaml");
        fs::write(&path, "smoke_enabled: true\ntracker_url: http://localhost:3000\n").unwrap();
        let config = OrchestratorConfig::load(&path).unwrap();
        assert!(config.smoke_enabled);
        assert_eq!(config.tracker_url.as_deref(), Some("http://localhost:3000"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = OrchestratorConfig::load_or_default(&dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config.agent.command, "claude");
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orchestrate.yaml");
        fs::write(&path, "retry: [not, a, map]").unwrap();
        assert!(OrchestratorConfig::load(&path).is_err());
    }
}
