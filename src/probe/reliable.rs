use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::tcp::measure_connect;
use super::{ProbeStrategy, StrategyKind, endpoint_index};
use crate::config::ProbeConfig;
use crate::descriptor::ProxyDescriptor;
use crate::error::ProbeError;

const ICMP_UNKNOWN: u8 = 0;
const ICMP_AVAILABLE: u8 = 1;
const ICMP_DENIED: u8 = 2;

/// Resolve `host`, taking the first IPv4 address if there is one.
pub async fn resolve_preferring_ipv4(host: &str) -> Result<IpAddr, ProbeError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::ResolutionFailure {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip())
        .ok_or_else(|| ProbeError::ResolutionFailure {
            host: host.to_string(),
            reason: "no addresses".into(),
        })
}

/// ICMP echo through the system `ping`.
///
/// Whether ICMP works at all is learned from the first attempt: if `ping`
/// cannot be started or lacks the privilege to open its socket, every later
/// call returns `None` right away.
pub struct IcmpProbe {
    program: &'static str,
    count: u32,
    timeout: Duration,
    state: AtomicU8,
}

impl IcmpProbe {
    pub fn new(count: u32, timeout: Duration, enabled: bool) -> Self {
        Self {
            program: "ping",
            count: count.max(1),
            timeout,
            state: AtomicU8::new(if enabled { ICMP_UNKNOWN } else { ICMP_DENIED }),
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.load(Ordering::Relaxed) != ICMP_DENIED
    }

    /// Average round trip to `ip` in milliseconds.
    pub async fn ping(&self, ip: IpAddr) -> Option<u64> {
        if !self.is_available() {
            return None;
        }

        let mut command = Command::new(self.program_for(ip));
        command
            .args(ping_args(ip, self.count, self.timeout))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let deadline = self.timeout * self.count + Duration::from_secs(2);
        let output = match tokio::time::timeout(deadline, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.deny(&format!("cannot run {}: {}", self.program, e));
                return None;
            }
            Err(_) => {
                debug!("ping {} gave no answer within {:?}", ip, deadline);
                return None;
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_permission_error(&stderr) {
            self.deny(stderr.trim());
            return None;
        }
        let _ = self.state.compare_exchange(
            ICMP_UNKNOWN,
            ICMP_AVAILABLE,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );

        let average = parse_ping_average(&String::from_utf8_lossy(&output.stdout));
        if average.is_none() {
            debug!("ping {}: no round trip summary ({})", ip, output.status);
        }
        average
    }

    fn program_for(&self, ip: IpAddr) -> &'static str {
        if cfg!(target_os = "macos") && ip.is_ipv6() {
            "ping6"
        } else {
            self.program
        }
    }

    fn deny(&self, reason: &str) {
        if self.state.swap(ICMP_DENIED, Ordering::Relaxed) != ICMP_DENIED {
            warn!("ICMP unavailable, using TCP connect for the rest of the run: {}", reason);
        }
    }
}

fn ping_args(ip: IpAddr, count: u32, timeout: Duration) -> Vec<String> {
    let count = count.to_string();
    let ip = ip.to_string();
    if cfg!(windows) {
        let wait_ms = timeout.as_millis().to_string();
        vec!["-n".into(), count, "-w".into(), wait_ms, ip]
    } else if cfg!(target_os = "macos") {
        // milliseconds here, seconds on Linux
        let wait_ms = timeout.as_millis().to_string();
        vec!["-c".into(), count, "-W".into(), wait_ms, ip]
    } else {
        let wait_secs = timeout.as_secs_f64().ceil().max(1.0).to_string();
        vec!["-c".into(), count, "-W".into(), wait_secs, ip]
    }
}

fn is_permission_error(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["operation not permitted", "permission denied", "lacking privilege", "cap_net_raw"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

/// Average round trip from a `ping` summary, rounded to whole milliseconds.
///
/// Understands the `min/avg/max` line of iputils, BSD and busybox ping and
/// the `Average = Nms` line of Windows ping.
pub fn parse_ping_average(output: &str) -> Option<u64> {
    for line in output.lines() {
        let line = line.trim();
        if line.contains("min/avg/max") {
            let (_, values) = line.split_once('=')?;
            let avg: f64 = values.trim().split('/').nth(1)?.trim().parse().ok()?;
            return (avg.is_finite() && avg >= 0.0).then(|| avg.round() as u64);
        }
        if let Some((_, rest)) = line.split_once("Average = ") {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            return digits.parse().ok();
        }
    }
    None
}

/// ICMP to the resolved server, falling back to the best TCP connect
/// mean across a fixed set of common ports.
pub struct ReliableStrategy {
    endpoints: HashMap<String, (String, u16)>,
    icmp: IcmpProbe,
    fallback_ports: Vec<u16>,
    attempts: u32,
    connect_timeout: Duration,
    pacing: Duration,
}

impl ReliableStrategy {
    pub fn new(descriptors: &[ProxyDescriptor], config: &ProbeConfig) -> Self {
        Self {
            endpoints: endpoint_index(descriptors),
            icmp: IcmpProbe::new(config.icmp_count, config.icmp_timeout(), config.icmp_enabled),
            fallback_ports: config.fallback_ports.clone(),
            attempts: config.tcp_attempts,
            connect_timeout: config.tcp_timeout(),
            pacing: config.pacing(),
        }
    }

    async fn best_tcp_mean(&self, ip: IpAddr) -> Option<u64> {
        let mut best: Option<u64> = None;
        for &port in &self.fallback_ports {
            let stats =
                measure_connect(SocketAddr::new(ip, port), self.attempts, self.connect_timeout)
                    .await;
            if let Some(mean) = stats.mean_ms() {
                debug!("{}:{} mean connect {} ms", ip, port, mean);
                best = Some(best.map_or(mean, |b| b.min(mean)));
            }
        }
        best
    }
}

#[async_trait]
impl ProbeStrategy for ReliableStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Reliable
    }

    fn pacing(&self) -> Duration {
        self.pacing
    }

    async fn probe_one(&self, name: &str) -> Result<u64, ProbeError> {
        let (host, _) = self
            .endpoints
            .get(name)
            .ok_or_else(|| ProbeError::UnknownProxy(name.to_string()))?;
        let ip = resolve_preferring_ipv4(host).await?;
        debug!("{} resolved to {}", name, ip);

        if let Some(ms) = self.icmp.ping(ip).await {
            info!("  ICMP {} ms", ms);
            return Ok(ms);
        }
        if let Some(ms) = self.best_tcp_mean(ip).await {
            info!("  TCP connect {} ms", ms);
            return Ok(ms);
        }
        Err(ProbeError::Unreachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ProtocolOptions;
    use tokio::net::TcpListener;

    const IPUTILS: &str = "\
PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.
64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=7.85 ms

--- 1.1.1.1 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 2003ms
rtt min/avg/max/mdev = 7.851/8.635/8.824/0.414 ms
";

    const BSD: &str = "\
--- 1.1.1.1 ping statistics ---
3 packets transmitted, 3 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 10.105/12.310/14.512/1.800 ms
";

    const WINDOWS: &str = "\
Ping statistics for 1.1.1.1:
    Packets: Sent = 3, Received = 3, Lost = 0 (0% loss),
Approximate round trip times in milli-seconds:
    Minimum = 4ms, Maximum = 6ms, Average = 5ms
";

    const ALL_LOST: &str = "\
--- 10.255.255.1 ping statistics ---
3 packets transmitted, 0 received, 100% packet loss, time 2040ms
";

    fn descriptor(name: &str, host: &str) -> ProxyDescriptor {
        ProxyDescriptor {
            name: name.into(),
            host: host.into(),
            port: 8388,
            tls: false,
            sni: None,
            skip_cert_verify: false,
            udp: Some(true),
            options: ProtocolOptions::Shadowsocks {
                cipher: Some("aes-256-gcm".into()),
                password: "pw".into(),
            },
        }
    }

    fn tcp_only(fallback_ports: Vec<u16>) -> ProbeConfig {
        ProbeConfig {
            icmp_enabled: false,
            fallback_ports,
            pacing_ms: 0,
            tcp_timeout_ms: 1000,
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn parses_ping_summaries() {
        assert_eq!(parse_ping_average(IPUTILS), Some(9));
        assert_eq!(parse_ping_average(BSD), Some(12));
        assert_eq!(parse_ping_average(WINDOWS), Some(5));
        assert_eq!(parse_ping_average(ALL_LOST), None);
        assert_eq!(parse_ping_average(""), None);
    }

    #[tokio::test]
    async fn resolves_literals_and_prefers_ipv4() {
        assert_eq!(
            resolve_preferring_ipv4("::1").await.unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
        let ip = resolve_preferring_ipv4("localhost").await.unwrap();
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn missing_ping_binary_disables_icmp() {
        let mut icmp = IcmpProbe::new(1, Duration::from_millis(200), true);
        icmp.program = "nodeprobe-no-such-ping";
        assert!(icmp.is_available());

        assert_eq!(icmp.ping("127.0.0.1".parse().unwrap()).await, None);
        assert!(!icmp.is_available());
    }

    #[tokio::test]
    async fn falls_back_to_best_tcp_port() {
        let open = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = open.local_addr().unwrap().port();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let descriptors = vec![descriptor("Local", "127.0.0.1")];
        let strategy = ReliableStrategy::new(&descriptors, &tcp_only(vec![closed_port, open_port]));
        assert!(strategy.probe_one("Local").await.is_ok());

        let strategy = ReliableStrategy::new(&descriptors, &tcp_only(vec![closed_port]));
        assert!(matches!(
            strategy.probe_one("Local").await,
            Err(ProbeError::Unreachable)
        ));
    }

    #[tokio::test]
    async fn unknown_name_is_reported_without_probing() {
        let strategy = ReliableStrategy::new(&[], &tcp_only(vec![80]));
        let results = strategy.probe(&["Nope".to_string()]).await;
        assert_eq!(results[0].latency_ms, -1);
        assert_eq!(results[0].error_kind(), Some("UnknownProxy"));
    }
}
