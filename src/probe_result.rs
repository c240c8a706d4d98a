use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProbeError;
use crate::probe::StrategyKind;

/// Latency reported for a proxy that could not be measured.
pub const UNREACHABLE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    /// Milliseconds, or [`UNREACHABLE`].
    pub latency_ms: i64,
    pub strategy: StrategyKind,
    pub timestamp: DateTime<Utc>,
    /// `"<kind>: <message>"` when the probe failed.
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn measured(name: impl Into<String>, strategy: StrategyKind, latency_ms: u64) -> Self {
        ProbeResult {
            name: name.into(),
            latency_ms: i64::try_from(latency_ms).unwrap_or(i64::MAX),
            strategy,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, strategy: StrategyKind, error: &ProbeError) -> Self {
        ProbeResult {
            name: name.into(),
            latency_ms: UNREACHABLE,
            strategy,
            timestamp: Utc::now(),
            error: Some(format!("{}: {}", error.kind(), error)),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.latency_ms >= 0
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error
            .as_deref()
            .map(|e| e.split_once(':').map_or(e, |(kind, _)| kind))
    }
}
