//! Coding-agent session interface.
//!
//! The orchestrator treats the agent as opaque: execute a prompt in a
//! working directory under a timeout, get back result text and a session id.
//! `CliAgent` adapts any claude-style CLI that supports print mode with a
//! JSON result envelope.

use crate::command::run_command;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub result: String,
    pub session_id: Option<String>,
}

#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn execute_prompt(&self, prompt: &str, options: &PromptOptions)
        -> Result<PromptOutcome>;
}

/// Result envelope printed by the agent CLI in JSON output mode.
#[derive(Debug, Deserialize)]
struct AgentEnvelope {
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    session_id: Option<String>,
}

/// Agent backed by a local CLI binary invoked per prompt.
pub struct CliAgent {
    command: String,
    args: Vec<String>,
}

impl CliAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentSession for CliAgent {
    async fn execute_prompt(
        &self,
        prompt: &str,
        options: &PromptOptions,
    ) -> Result<PromptOutcome> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("json")
            .current_dir(&options.working_dir);

        tracing::info!(agent = %self.command, "Dispatching prompt to agent session");
        let raw = run_command(command, options.timeout).await;

        if raw.timed_out {
            anyhow::bail!(
                "Agent session timed out after {:?}",
                options.timeout
            );
        }
        if !raw.success {
            anyhow::bail!(
                "Agent process failed: {}",
                truncate_line(&raw.combined(), 500)
            );
        }

        // The envelope is best-effort: an agent that prints plain text still
        // counts as a dispatch result.
        match serde_json::from_str::<AgentEnvelope>(&raw.stdout) {
            Ok(envelope) => {
                if envelope.is_error {
                    anyhow::bail!("Agent returned an error: {}", truncate_line(&envelope.result, 500));
                }
                Ok(PromptOutcome {
                    result: envelope.result,
                    session_id: envelope.session_id,
                })
            }
            Err(_) => Ok(PromptOutcome {
                result: raw.stdout,
                session_id: None,
            }),
        }
    }
}

fn truncate_line(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
