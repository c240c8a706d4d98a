use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{ProbeStrategy, StrategyKind};
use crate::config::ProbeConfig;
use crate::controller::{ControlClient, Delay};
use crate::error::ProbeError;

/// Delay as measured by the daemon itself, best of the test URLs.
pub struct ApiDelayStrategy {
    client: ControlClient,
    test_urls: Vec<String>,
    timeout_ms: u64,
    pacing: Duration,
}

impl ApiDelayStrategy {
    pub fn new(client: ControlClient, config: &ProbeConfig) -> Self {
        Self {
            client,
            test_urls: config.test_urls.clone(),
            timeout_ms: config.delay_timeout_ms,
            pacing: config.pacing(),
        }
    }
}

#[async_trait]
impl ProbeStrategy for ApiDelayStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Api
    }

    fn pacing(&self) -> Duration {
        self.pacing
    }

    async fn probe_one(&self, name: &str) -> Result<u64, ProbeError> {
        let mut best: Option<u64> = None;
        for url in &self.test_urls {
            match self.client.measure_delay(name, url, self.timeout_ms).await? {
                Delay::Measured(ms) => {
                    debug!("{} via {}: {} ms", name, url, ms);
                    best = Some(best.map_or(ms, |b| b.min(ms)));
                }
                Delay::Unreachable => debug!("{} via {}: unreachable", name, url),
            }
        }
        best.ok_or(ProbeError::Unreachable)
    }
}
