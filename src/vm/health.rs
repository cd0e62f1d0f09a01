//! Health-gated readiness for the agent inside the VM.
//!
//! The agent answers `GET /health` with `200 {"status":"ready","version":…}`
//! once it can take work. Anything else (connection refused, timeout,
//! non-200, a different status) means "not ready yet"; during boot that is
//! expected and only logged at debug.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::retry::{PollError, PollPolicy, poll_until};
use crate::{Error, Result};

/// Result of a single probe. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    /// An HTTP response arrived, whatever its status.
    pub reachable: bool,
    pub ready: bool,
    pub http_status: Option<u16>,
    /// Raw JSON body when it parsed.
    pub payload: Option<serde_json::Value>,
}

impl HealthStatus {
    fn unreachable() -> Self {
        Self {
            reachable: false,
            ready: false,
            http_status: None,
            payload: None,
        }
    }

    /// Agent version reported by a ready payload.
    pub fn version(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("version"))
            .and_then(|v| v.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct HealthReport {
    status: String,
}

/// Polls the agent's health endpoint.
#[derive(Debug, Clone)]
pub struct HealthPoller {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl HealthPoller {
    /// `request_timeout` bounds each probe so one hung request cannot eat
    /// the whole wait budget.
    pub fn new(
        endpoint: &str,
        health_path: &str,
        request_timeout: Duration,
        interval: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Config(format!("health client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}{}", endpoint.trim_end_matches('/'), health_path),
            interval,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Probe the endpoint once.
    pub async fn check_once(&self) -> HealthStatus {
        let resp = match self.client.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(url = %self.url, error = %e, "health probe failed");
                return HealthStatus::unreachable();
            }
        };

        let status = resp.status();
        let payload = resp.json::<serde_json::Value>().await.ok();
        let ready = status == reqwest::StatusCode::OK
            && payload
                .clone()
                .and_then(|p| serde_json::from_value::<HealthReport>(p).ok())
                .is_some_and(|report| report.status == "ready");

        debug!(url = %self.url, http_status = status.as_u16(), ready, "health probe");
        HealthStatus {
            reachable: true,
            ready,
            http_status: Some(status.as_u16()),
            payload,
        }
    }

    /// Poll until the agent is ready, `timeout` elapses (`StartupTimeout`) or
    /// `cancel` fires (`Cancelled`).
    pub async fn wait_until_ready(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HealthStatus> {
        let policy = PollPolicy::new(self.interval, timeout);

        let result = poll_until(policy, cancel, |attempt| async move {
            let status = self.check_once().await;
            if !status.ready {
                debug!(attempt, reachable = status.reachable, "agent not ready yet");
            }
            status.ready.then_some(status)
        })
        .await;

        match result {
            Ok(status) => {
                info!(url = %self.url, version = status.version().unwrap_or("unknown"), "agent ready");
                Ok(status)
            }
            Err(PollError::Cancelled) => Err(Error::Cancelled),
            Err(PollError::TimedOut { attempts, .. }) => Err(Error::StartupTimeout {
                waited: timeout,
                attempts,
            }),
        }
    }
}
