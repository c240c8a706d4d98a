use anyhow::Result;
use async_trait::async_trait;
use clap::ValueEnum;

use crate::descriptor::{ProxyDescriptor, descriptors_to_clash_yaml};
use crate::parser::DecodedBundle;
use crate::probe_engine::ProbeReport;
use crate::reporter::ProbeReporter;

/// How `decode` prints descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DecodeFormat {
    /// Clash `proxies:` document
    #[default]
    Yaml,
    Json,
    /// One share link per line
    Links,
}

pub fn render_descriptors(descriptors: &[ProxyDescriptor], format: DecodeFormat) -> Result<String> {
    Ok(match format {
        DecodeFormat::Yaml => descriptors_to_clash_yaml(descriptors)?,
        DecodeFormat::Json => serde_json::to_string_pretty(descriptors)?,
        DecodeFormat::Links => descriptors
            .iter()
            .map(|d| d.to_link())
            .collect::<Vec<_>>()
            .join("\n"),
    })
}

/// Per-item problems and aggregate counts of a decoded bundle, for stderr.
pub fn render_bundle_summary(bundle: &DecodedBundle) -> String {
    let mut out = String::new();
    for item in &bundle.skipped {
        let status = if item.is_error() { "error" } else { "skipped" };
        out.push_str(&format!(
            "line {:<4} {:<8} {:<20} {}\n",
            item.line,
            status,
            item.error.kind(),
            truncate(&item.preview, 40)
        ));
    }
    out.push_str(&format!(
        "{} decoded, {} skipped, {} errored\n",
        bundle.succeeded(),
        bundle.skipped_unsupported(),
        bundle.errored()
    ));
    out
}

pub fn display_report(report: &ProbeReport, verbose: bool) {
    println!("\n=== Probe Results ({}) ===", report.strategy);
    println!("{:<4} {:<32} {:<10} {}", "#", "Name", "Latency", "Status");
    println!("{}", "=".repeat(60));

    for (i, result) in report.results.iter().enumerate() {
        let (latency, status) = if result.is_reachable() {
            (format!("{}ms", result.latency_ms), "✓ OK")
        } else {
            ("-".to_string(), "✗ DEAD")
        };
        println!(
            "{:<4} {:<32} {:<10} {}",
            i + 1,
            truncate(&result.name, 31),
            latency,
            status
        );

        if verbose {
            if let Some(error) = &result.error {
                println!("    Error: {}", error);
            }
        }
    }

    for warning in &report.warnings {
        println!("Warning: {}", warning);
    }
    if report.cancelled {
        println!("Probe cancelled");
    }

    let total = report.results.len();
    println!("\n=== Summary ===");
    println!("Total proxies: {}", total);
    println!("Reachable: {}", report.reachable());
    println!("Unreachable: {}", report.unreachable());
    if total > 0 {
        println!(
            "Success rate: {:.1}%",
            (report.reachable() as f64 / total as f64) * 100.0
        );
    }
    println!("Elapsed: {:.2}s", report.elapsed_ms as f64 / 1000.0);
}

pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl ProbeReporter for ConsoleReporter {
    async fn report(&self, report: &ProbeReport) -> Result<()> {
        display_report(report, self.verbose);
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Prints the whole report as pretty JSON on stdout.
pub struct JsonReporter;

#[async_trait]
impl ProbeReporter for JsonReporter {
    async fn report(&self, report: &ProbeReport) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }

    fn name(&self) -> &str {
        "json"
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        // reserve 3 chars for "..."
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
