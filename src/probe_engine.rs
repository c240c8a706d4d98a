use crate::config::Config;
use crate::controller::ControlClient;
use crate::descriptor::ProxyDescriptor;
use crate::mode_guard::{GuardOutcome, ModeGuard};
use crate::probe::{ApiDelayStrategy, ProbeStrategy, ReliableStrategy, SimpleStrategy, StrategyKind};
use crate::probe_result::ProbeResult;
use crate::ranker::rank;
use crate::reporter::ProbeReporter;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Ranked outcome of one probing run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub strategy: StrategyKind,
    pub results: Vec<ProbeResult>,
    /// Non-fatal problems, e.g. a selection that could not be restored.
    pub warnings: Vec<String>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl ProbeReport {
    pub fn reachable(&self) -> usize {
        self.results.iter().filter(|r| r.is_reachable()).count()
    }

    pub fn unreachable(&self) -> usize {
        self.results.len() - self.reachable()
    }
}

pub struct ProbeEngine {
    config: Arc<Config>,
    client: Option<ControlClient>,
    descriptors: Vec<ProxyDescriptor>,
    reporters: Vec<Box<dyn ProbeReporter>>,
}

impl ProbeEngine {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            client: None,
            descriptors: Vec::new(),
            reporters: Vec::new(),
        }
    }

    pub fn with_controller(mut self, client: ControlClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Descriptors the raw TCP strategies look names up in.
    pub fn with_descriptors(mut self, descriptors: Vec<ProxyDescriptor>) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn register_reporter(&mut self, reporter: Box<dyn ProbeReporter>) -> &mut Self {
        self.reporters.push(reporter);
        self
    }

    pub fn build_strategy(&self, kind: StrategyKind) -> Result<Box<dyn ProbeStrategy>> {
        let probe = &self.config.probe;
        Ok(match kind {
            StrategyKind::Api => {
                let client = self
                    .client
                    .clone()
                    .context("the api strategy needs a controller")?;
                Box::new(ApiDelayStrategy::new(client, probe))
            }
            StrategyKind::Simple => Box::new(SimpleStrategy::new(&self.descriptors, probe)),
            StrategyKind::Reliable => Box::new(ReliableStrategy::new(&self.descriptors, probe)),
        })
    }

    /// Names to probe when the caller gives none: the daemon's selectable
    /// proxies for the api strategy, every known descriptor otherwise.
    pub async fn default_targets(&self, kind: StrategyKind) -> Result<Vec<String>> {
        match (kind, &self.client) {
            (StrategyKind::Api, Some(client)) => Ok(client.probe_targets().await?),
            (StrategyKind::Api, None) => bail!("the api strategy needs a controller"),
            _ => Ok(self.descriptors.iter().map(|d| d.name.clone()).collect()),
        }
    }

    pub async fn probe(
        &self,
        names: &[String],
        kind: StrategyKind,
        use_guard: bool,
    ) -> Result<ProbeReport> {
        self.probe_until(names, kind, use_guard, std::future::pending::<()>())
            .await
    }

    /// Probe `names`, stopping early once `cancel` resolves. With `use_guard`
    /// the run happens in direct mode and the previous selection is restored
    /// before this returns, cancelled or not. A repeated name is measured once.
    pub async fn probe_until<C: Future>(
        &self,
        names: &[String],
        kind: StrategyKind,
        use_guard: bool,
        cancel: C,
    ) -> Result<ProbeReport> {
        let strategy = self.build_strategy(kind)?;
        let names = &unique_names(names);
        let start_time = Instant::now();

        let (results, warnings, cancelled) = if use_guard {
            let client = self
                .client
                .clone()
                .context("direct mode needs a controller")?;
            let guard = ModeGuard::new(client, &self.config.guard);
            let guarded = guard
                .with_direct_mode_until(|| strategy.probe(names), cancel)
                .await;
            match guarded.outcome {
                GuardOutcome::Completed(results) => (results, guarded.warnings, false),
                GuardOutcome::Cancelled => (Vec::new(), guarded.warnings, true),
            }
        } else {
            tokio::select! {
                results = strategy.probe(names) => (results, Vec::new(), false),
                _ = cancel => (Vec::new(), Vec::new(), true),
            }
        };

        for warning in &warnings {
            warn!("{}", warning);
        }

        let elapsed = start_time.elapsed();
        let report = ProbeReport {
            strategy: kind,
            results: rank(results),
            warnings,
            cancelled,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        };

        if report.cancelled {
            info!("Probe cancelled after {:.2}s", elapsed.as_secs_f64());
        } else {
            info!(
                "Probe completed in {:.2}s - {}/{} proxies reachable",
                elapsed.as_secs_f64(),
                report.reachable(),
                report.results.len()
            );
        }

        Ok(report)
    }

    /// Probe, then hand the report to every registered reporter.
    pub async fn run<C: Future>(
        &self,
        names: &[String],
        kind: StrategyKind,
        use_guard: bool,
        cancel: C,
    ) -> Result<ProbeReport> {
        if self.reporters.is_empty() {
            return Err(anyhow::anyhow!("No reporters registered"));
        }

        let report = self.probe_until(names, kind, use_guard, cancel).await?;
        self.notify_reporters(&report).await;
        Ok(report)
    }

    async fn notify_reporters(&self, report: &ProbeReport) {
        for reporter in &self.reporters {
            if let Err(e) = reporter.report(report).await {
                error!("Reporter '{}' failed: {}", reporter.name(), e);
            }
        }
    }
}

/// `names` without repeats, first occurrence wins.
fn unique_names(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::controller::mock::{self, MockState, selector};
    use crate::descriptor::ProtocolOptions;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const TEST_URL: &str = "http://probe.test/generate_204";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.probe = ProbeConfig {
            test_urls: vec![TEST_URL.into()],
            pacing_ms: 0,
            tcp_timeout_ms: 1000,
            icmp_enabled: false,
            ..ProbeConfig::default()
        };
        config.guard.settle_ms = 0;
        config
    }

    fn ss(name: &str, port: u16) -> ProxyDescriptor {
        ProxyDescriptor {
            name: name.into(),
            host: "127.0.0.1".into(),
            port,
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

    async fn daemon() -> (ControlClient, mock::Shared) {
        let mut state = MockState::default();
        state.groups.insert(
            "GLOBAL".into(),
            selector(&["DIRECT", "NodeA", "NodeB", "NodeC"], "NodeA"),
        );
        state
            .delays
            .insert("NodeA".into(), HashMap::from([(TEST_URL.to_string(), 120)]));
        state
            .delays
            .insert("NodeB".into(), HashMap::from([(TEST_URL.to_string(), 40)]));
        let shared = Arc::new(Mutex::new(state));
        let base = mock::serve(shared.clone()).await;
        let client = ControlClient::new(base, None, Duration::from_secs(5)).unwrap();
        (client, shared)
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn latencies(report: &ProbeReport) -> Vec<(&str, i64)> {
        report
            .results
            .iter()
            .map(|r| (r.name.as_str(), r.latency_ms))
            .collect()
    }

    #[tokio::test]
    async fn simple_probe_is_ranked() {
        let open = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = open.local_addr().unwrap().port();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let engine = ProbeEngine::new(test_config())
            .with_descriptors(vec![ss("Closed", closed_port), ss("Open", open_port)]);
        let report = engine
            .probe(&names(&["Closed", "Open"]), StrategyKind::Simple, false)
            .await
            .unwrap();

        let ranked: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(ranked, vec!["Open", "Closed"]);
        assert_eq!(report.reachable(), 1);
        assert_eq!(report.unreachable(), 1);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn repeated_names_are_measured_once() {
        let (client, _) = daemon().await;
        let engine = ProbeEngine::new(test_config()).with_controller(client);

        let report = engine
            .probe(
                &names(&["NodeB", "NodeA", "NodeB", "NodeA"]),
                StrategyKind::Api,
                false,
            )
            .await
            .unwrap();

        assert_eq!(latencies(&report), vec![("NodeB", 40), ("NodeA", 120)]);
    }

    #[test]
    fn unique_names_keeps_first_occurrence_order() {
        assert_eq!(
            unique_names(&names(&["b", "a", "b", "c", "a"])),
            names(&["b", "a", "c"])
        );
    }

    #[tokio::test]
    async fn guarded_api_probe_restores_selection() {
        let (client, shared) = daemon().await;
        let engine = ProbeEngine::new(test_config()).with_controller(client);

        let report = engine
            .probe(&names(&["NodeA", "NodeB", "NodeC"]), StrategyKind::Api, true)
            .await
            .unwrap();

        assert_eq!(
            latencies(&report),
            vec![("NodeB", 40), ("NodeA", 120), ("NodeC", -1)]
        );
        assert!(report.warnings.is_empty());
        let state = shared.lock().unwrap();
        assert_eq!(state.groups["GLOBAL"].now.as_deref(), Some("NodeA"));
        assert_eq!(
            state.switch_log.first(),
            Some(&("GLOBAL".to_string(), "DIRECT".to_string()))
        );
    }

    #[tokio::test]
    async fn cancelled_probe_still_restores_selection() {
        let (client, shared) = daemon().await;
        let engine = ProbeEngine::new(test_config()).with_controller(client);

        let report = engine
            .probe_until(
                &names(&["NodeA", "NodeB"]),
                StrategyKind::Api,
                true,
                std::future::ready(()),
            )
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(report.results.is_empty());
        assert_eq!(
            shared.lock().unwrap().groups["GLOBAL"].now.as_deref(),
            Some("NodeA")
        );
    }

    #[tokio::test]
    async fn api_strategy_requires_a_controller() {
        let engine = ProbeEngine::new(test_config());
        assert!(engine.build_strategy(StrategyKind::Api).is_err());
        assert!(
            engine
                .probe(&names(&["NodeA"]), StrategyKind::Simple, true)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn default_targets_follow_the_strategy() {
        let (client, _) = daemon().await;
        let engine = ProbeEngine::new(test_config())
            .with_controller(client)
            .with_descriptors(vec![ss("Local", 8388)]);

        assert_eq!(
            engine.default_targets(StrategyKind::Api).await.unwrap(),
            names(&["NodeA", "NodeB", "NodeC"])
        );
        assert_eq!(
            engine.default_targets(StrategyKind::Reliable).await.unwrap(),
            names(&["Local"])
        );
    }

    struct Recording {
        seen: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl ProbeReporter for Recording {
        async fn report(&self, report: &ProbeReport) -> Result<()> {
            self.seen.lock().unwrap().push(report.results.len());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn run_notifies_reporters() {
        let (client, _) = daemon().await;
        let mut engine = ProbeEngine::new(test_config()).with_controller(client);
        assert!(
            engine
                .run(&names(&["NodeA"]), StrategyKind::Api, false, std::future::pending::<()>())
                .await
                .is_err()
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        engine.register_reporter(Box::new(Recording { seen: seen.clone() }));
        engine
            .run(&names(&["NodeA", "NodeB"]), StrategyKind::Api, false, std::future::pending::<()>())
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }
}
