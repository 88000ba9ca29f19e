//! HTTP health probe for the supervised server.
//!
//! Issues one bounded `GET {base}/health`. A 2xx answer is Ready; every
//! other outcome (refused connection, timeout, non-2xx) is NotReady. The JSON
//! body is surfaced for status reporting and otherwise left alone.

use std::time::Duration;

use serde::Deserialize;

/// Path of the health endpoint on the supervised server.
pub const HEALTH_PATH: &str = "/health";

/// Fields the server reports on its health endpoint.
///
/// All optional: a 2xx with an empty or non-JSON body is still Ready.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HealthReport {
    pub status: Option<String>,
    /// Working directory of the server process.
    #[serde(alias = "workdir")]
    pub cwd: Option<String>,
}

/// Outcome of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Ready(HealthReport),
    /// Carries a short reason for logs.
    NotReady(String),
}

impl HealthStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthStatus::Ready(_))
    }

    pub fn report(&self) -> Option<&HealthReport> {
        match self {
            HealthStatus::Ready(report) => Some(report),
            HealthStatus::NotReady(_) => None,
        }
    }
}

/// Issues health probes with a fixed per-call timeout.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        // Local probes must not be routed through an ambient HTTP proxy
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe `{base_url}/health` once.
    pub async fn probe(&self, base_url: &str) -> HealthStatus {
        let url = format!("{}{}", base_url.trim_end_matches('/'), HEALTH_PATH);

        let response = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!("timed out after {}ms", self.timeout.as_millis())
                } else {
                    e.to_string()
                };
                tracing::debug!(url = %url, reason = %reason, "health probe failed");
                return HealthStatus::NotReady(reason);
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url = %url, status = %status, "health probe got non-2xx");
            return HealthStatus::NotReady(format!("HTTP {}", status));
        }

        let report = response
            .json::<HealthReport>()
            .await
            .unwrap_or_default();
        HealthStatus::Ready(report)
    }
}
