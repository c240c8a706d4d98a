use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::debug;

use super::{ProbeStrategy, StrategyKind, endpoint_index};
use crate::config::ProbeConfig;
use crate::descriptor::ProxyDescriptor;
use crate::error::ProbeError;

/// Outcome of a series of TCP connect attempts to one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectStats {
    pub attempts: u32,
    pub successes: u32,
    pub total: Duration,
}

impl ConnectStats {
    pub fn failures(&self) -> u32 {
        self.attempts - self.successes
    }

    /// Mean connect time over the successful attempts.
    pub fn mean_ms(&self) -> Option<u64> {
        if self.successes == 0 {
            return None;
        }
        let mean = self.total.as_millis() / u128::from(self.successes);
        Some(u64::try_from(mean).unwrap_or(u64::MAX))
    }
}

/// Connect to `addr` `attempts` times, each bounded by `connect_timeout`.
pub async fn measure_connect<A>(addr: A, attempts: u32, connect_timeout: Duration) -> ConnectStats
where
    A: ToSocketAddrs + Clone,
{
    let mut stats = ConnectStats {
        attempts,
        ..ConnectStats::default()
    };

    for attempt in 1..=attempts {
        let start = Instant::now();
        match timeout(connect_timeout, TcpStream::connect(addr.clone())).await {
            Ok(Ok(stream)) => {
                stats.total += start.elapsed();
                stats.successes += 1;
                drop(stream);
            }
            Ok(Err(e)) => debug!("connect attempt {}/{} failed: {}", attempt, attempts, e),
            Err(_) => debug!(
                "connect attempt {}/{} timed out after {:?}",
                attempt, attempts, connect_timeout
            ),
        }
    }

    stats
}

/// Mean TCP connect time to the proxy server itself.
pub struct SimpleStrategy {
    endpoints: HashMap<String, (String, u16)>,
    attempts: u32,
    connect_timeout: Duration,
    pacing: Duration,
}

impl SimpleStrategy {
    pub fn new(descriptors: &[ProxyDescriptor], config: &ProbeConfig) -> Self {
        Self {
            endpoints: endpoint_index(descriptors),
            attempts: config.tcp_attempts,
            connect_timeout: config.tcp_timeout(),
            pacing: config.pacing(),
        }
    }
}

#[async_trait]
impl ProbeStrategy for SimpleStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Simple
    }

    fn pacing(&self) -> Duration {
        self.pacing
    }

    async fn probe_one(&self, name: &str) -> Result<u64, ProbeError> {
        let (host, port) = self
            .endpoints
            .get(name)
            .ok_or_else(|| ProbeError::UnknownProxy(name.to_string()))?;

        let stats = measure_connect((host.as_str(), *port), self.attempts, self.connect_timeout).await;
        debug!(
            "{} ({}:{}): {}/{} connects succeeded",
            name, host, port, stats.successes, stats.attempts
        );
        stats.mean_ms().ok_or(ProbeError::Unreachable)
    }
}
