//! Latency measurement strategies.
//!
//! Every strategy probes names one at a time with a pause in between, and
//! a failing name only ever costs that name its measurement.

mod api_delay;
mod reliable;
mod tcp;

pub use api_delay::ApiDelayStrategy;
pub use reliable::{IcmpProbe, ReliableStrategy, parse_ping_average, resolve_preferring_ipv4};
pub use tcp::{ConnectStats, SimpleStrategy, measure_connect};

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::descriptor::ProxyDescriptor;
use crate::error::ProbeError;
use crate::probe_result::ProbeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Ask the daemon to measure each proxy against the test URLs
    #[default]
    Api,
    /// Raw TCP connect to the proxy's own host:port
    Simple,
    /// ICMP echo to the resolved server, TCP connect on common ports as fallback
    Reliable,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StrategyKind::Api => "api",
            StrategyKind::Simple => "simple",
            StrategyKind::Reliable => "reliable",
        };
        f.write_str(label)
    }
}

#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Pause between two consecutive names.
    fn pacing(&self) -> Duration;

    /// Latency of a single proxy in milliseconds.
    async fn probe_one(&self, name: &str) -> Result<u64, ProbeError>;

    /// Probe `names` in order. Results come back in the same order.
    async fn probe(&self, names: &[String]) -> Vec<ProbeResult> {
        let kind = self.kind();
        let total = names.len();
        let mut results = Vec::with_capacity(total);

        for (i, name) in names.iter().enumerate() {
            info!("Probing {}/{} [{}]: {}", i + 1, total, kind, name);
            let result = match self.probe_one(name).await {
                Ok(latency) => {
                    info!("  {} ms", latency);
                    ProbeResult::measured(name, kind, latency)
                }
                Err(e) => {
                    warn!("  {} failed: {} ({})", name, e, e.kind());
                    ProbeResult::failed(name, kind, &e)
                }
            };
            results.push(result);

            let pacing = self.pacing();
            if i + 1 < total && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
        }

        results
    }
}

/// Server endpoint of every descriptor, keyed by proxy name.
pub fn endpoint_index(descriptors: &[ProxyDescriptor]) -> HashMap<String, (String, u16)> {
    descriptors
        .iter()
        .map(|d| (d.name.clone(), (d.host.clone(), d.port)))
        .collect()
}
