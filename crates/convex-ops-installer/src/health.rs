use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};

pub trait HealthProbe {
    /// One readiness check. Must return within its own timeout.
    fn probe(&self, url: &str) -> bool;
}

/// `GET <url>/version`, healthy only on `200 OK`.
pub struct HttpProbe {
    client: Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create health check HTTP client")?;
        Ok(Self { client, timeout })
    }
}

impl HealthProbe for HttpProbe {
    fn probe(&self, url: &str) -> bool {
        let endpoint = format!("{}/version", url.trim_end_matches('/'));
        match self.client.get(&endpoint).timeout(self.timeout).send() {
            Ok(response) => is_healthy_status(response.status()),
            Err(err) => {
                debug!(endpoint = %endpoint, error = %err, "health probe failed");
                false
            }
        }
    }
}

pub(crate) fn is_healthy_status(status: StatusCode) -> bool {
    status == StatusCode::OK
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthGate {
    pub budget: Duration,
    pub interval: Duration,
}

impl HealthGate {
    /// Polls until a probe succeeds or the budget is spent. Returns the number
    /// of probes issued.
    pub fn wait_healthy(&self, probe: &dyn HealthProbe, url: &str) -> LifecycleResult<u32> {
        let deadline = Instant::now() + self.budget;
        let mut attempts = 0_u32;

        loop {
            attempts += 1;
            if probe.probe(url) {
                debug!(url, attempts, "backend reported healthy");
                return Ok(attempts);
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.interval.min(deadline - now));
        }

        Err(LifecycleError::HealthTimeout {
            url: url.to_string(),
            timeout: self.budget,
        })
    }
}

