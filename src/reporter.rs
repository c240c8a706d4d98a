use crate::probe_engine::ProbeReport;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ProbeReporter: Send + Sync {
    async fn report(&self, report: &ProbeReport) -> Result<()>;

    fn name(&self) -> &str;
}
