use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub probe: ProbeConfig,
    pub guard: GuardConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub address: String,
    /// Sent as `Authorization: Bearer <secret>` when set.
    pub secret: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub test_urls: Vec<String>,
    pub delay_timeout_ms: u64,
    pub pacing_ms: u64,
    pub tcp_attempts: u32,
    pub tcp_timeout_ms: u64,
    pub fallback_ports: Vec<u16>,
    pub icmp_enabled: bool,
    pub icmp_count: u32,
    pub icmp_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardConfig {
    pub settle_ms: u64,
    pub direct_member: String,
    pub restore: RestoreScope,
}

/// Which selector groups the mode guard snapshots and restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreScope {
    /// Only the first selector found with a non-direct member.
    #[default]
    First,
    /// Every selector with a non-direct member.
    All,
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read config {}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("failed to parse config {}", path))?;
        Ok(config)
    }

    pub fn generate_default_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }
}

impl ControllerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ProbeConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn icmp_timeout(&self) -> Duration {
        Duration::from_millis(self.icmp_timeout_ms)
    }
}

impl GuardConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:9090".into(),
            secret: None,
            timeout_ms: 5000,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            test_urls: vec![
                "http://www.gstatic.com/generate_204".into(),
                "http://cp.cloudflare.com/generate_204".into(),
                "http://www.qualcomm.cn/generate_204".into(),
            ],
            delay_timeout_ms: 5000,
            pacing_ms: 200,
            tcp_attempts: 3,
            tcp_timeout_ms: 3000,
            fallback_ports: vec![80, 443, 8080, 1080],
            icmp_enabled: true,
            icmp_count: 3,
            icmp_timeout_ms: 1000,
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2000,
            direct_member: "DIRECT".into(),
            restore: RestoreScope::First,
        }
    }
}
