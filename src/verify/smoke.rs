//! HTTP smoke checks run once build artifacts are live.
//!
//! Each configured endpoint is probed for its expected status under its own
//! timeout; per-endpoint pass/fail aggregates into one overall smoke result.
//! Connection errors and wrong statuses are captured as data, never raised.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

fn default_expected_status() -> u16 {
    200
}

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmokeEndpoint {
    pub url: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmokeCheck {
    pub url: String,
    pub success: bool,
    pub output: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmokeTestResult {
    pub success: bool,
    pub checks: Vec<SmokeCheck>,
}

fn check_endpoint(endpoint: &SmokeEndpoint) -> SmokeCheck {
    let start = Instant::now();
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(endpoint.timeout_secs)))
        .http_status_as_error(false)
        .build();
    let agent: ureq::Agent = config.into();

    match agent.get(&endpoint.url).call() {
        Ok(response) => {
            let status = response.status().as_u16();
            let success = status == endpoint.expected_status;
            let output = if success {
                format!("{} -> {}", endpoint.url, status)
            } else {
                format!(
                    "{} -> {} (expected {})",
                    endpoint.url, status, endpoint.expected_status
                )
            };
            SmokeCheck {
                url: endpoint.url.clone(),
                success,
                output,
                duration: start.elapsed(),
            }
        }
        Err(e) => SmokeCheck {
            url: endpoint.url.clone(),
            success: false,
            output: format!("{} -> request failed: {}", endpoint.url, e),
            duration: start.elapsed(),
        },
    }
}

/// Probes every endpoint and aggregates into one result. An empty endpoint
/// list trivially passes (callers gate on configuration before invoking).
pub async fn run_smoke_tests(endpoints: &[SmokeEndpoint]) -> SmokeTestResult {
    let mut checks = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let ep = endpoint.clone();
        let check = tokio::task::spawn_blocking(move || check_endpoint(&ep))
            .await
            .unwrap_or_else(|e| SmokeCheck {
                url: endpoint.url.clone(),
                success: false,
                output: format!("{} -> check task failed: {}", endpoint.url, e),
                duration: Duration::ZERO,
            });
        tracing::debug!(url = %check.url, success = check.success, "Smoke check");
        checks.push(check);
    }
    SmokeTestResult {
        success: checks.iter().all(|c| c.success),
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// One-shot HTTP server answering every request with the given status.
    fn spawn_server(status_line: &'static str, responses: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for _ in 0..responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response =
                    format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    fn endpoint(url: String, expected: u16) -> SmokeEndpoint {
        SmokeEndpoint {
            url,
            expected_status: expected,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_expected_status_passes() {
        let base = spawn_server("200 OK", 1);
        let result = run_smoke_tests(&[endpoint(format!("{}/health", base), 200)]).await;
        assert!(result.success);
        assert_eq!(result.checks.len(), 1);
        assert!(result.checks[0].success);
    }

    #[tokio::test]
    async fn test_unexpected_status_fails() {
        let base = spawn_server("500 Internal Server Error", 1);
        let result = run_smoke_tests(&[endpoint(format!("{}/health", base), 200)]).await;
        assert!(!result.success);
        assert!(result.checks[0].output.contains("expected 200"));
    }

    #[tokio::test]
    async fn test_connection_failure_is_captured() {
        // Port 1 is practically never listening.
        let result = run_smoke_tests(&[endpoint("http://127.0.0.1:1/health".to_string(), 200)]).await;
        assert!(!result.success);
        assert!(result.checks[0].output.contains("request failed"));
    }

    #[tokio::test]
    async fn test_one_failing_endpoint_fails_the_aggregate() {
        let base = spawn_server("200 OK", 1);
        let result = run_smoke_tests(&[
            endpoint(format!("{}/health", base), 200),
            endpoint("http://127.0.0.1:1/health".to_string(), 200),
        ])
        .await;
        assert!(!result.success);
        assert!(result.checks[0].success);
        assert!(!result.checks[1].success);
    }

    #[tokio::test]
    async fn test_empty_endpoint_list_passes() {
        let result = run_smoke_tests(&[]).await;
        assert!(result.success);
        assert!(result.checks.is_empty());
    }

    #[test]
    fn test_endpoint_defaults_from_yaml() {
        let ep: SmokeEndpoint = serde_yaml::from_str("url: http://localhost:8080/health").unwrap();
        assert_eq!(ep.expected_status, 200);
        assert_eq!(ep.timeout_secs, 10);
    }
}
