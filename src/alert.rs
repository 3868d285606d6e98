//! External alerting sink.
//!
//! Alerts are plain-text messages posted to a configured relay (chat
//! webhook or similar). Delivery is best-effort: callers log failures and
//! never let them mask other failure handling.

use anyhow::{Context, Result};
use std::time::Duration;

/// Ceiling on outgoing alert size; longer messages are truncated.
pub const ALERT_MAX_CHARS: usize = 4000;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub trait AlertSink: Send + Sync {
    fn send(&self, message: &str) -> Result<()>;
}

/// Posts the message body to a webhook URL as plain text.
pub struct WebhookAlerts {
    url: String,
    agent: ureq::Agent,
}

impl WebhookAlerts {
    pub fn new(url: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(SEND_TIMEOUT))
            .build();
        Self {
            url: url.into(),
            agent: config.into(),
        }
    }
}

impl AlertSink for WebhookAlerts {
    fn send(&self, message: &str) -> Result<()> {
        let body = truncate(message, ALERT_MAX_CHARS);
        self.agent
            .post(&self.url)
            .header("Content-Type", "text/plain; charset=utf-8")
            .send(body.as_str())
            .with_context(|| format!("Failed to deliver alert to {}", self.url))?;
        Ok(())
    }
}

/// Sink used when no relay is configured; alerts land in the log only.
pub struct LogAlerts;

impl AlertSink for LogAlerts {
    fn send(&self, message: &str) -> Result<()> {
        tracing::warn!(alert = %truncate(message, ALERT_MAX_CHARS), "Alert (no webhook configured)");
        Ok(())
    }
}

pub fn truncate(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let mut out: String = message.chars().take(max_chars).collect();
    out.push_str("\n... (truncated)");
    out
}
