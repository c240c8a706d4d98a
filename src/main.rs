use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::future::{self, BoxFuture, FutureExt};
use std::task::Poll;
use tracing::{info, warn};

use nodeprobe::config::Config;
use nodeprobe::controller::ControlClient;
use nodeprobe::descriptor::ProxyDescriptor;
use nodeprobe::output::{
    ConsoleReporter, DecodeFormat, JsonReporter, render_bundle_summary, render_descriptors,
};
use nodeprobe::parser::{DecodedBundle, decode_bundle};
use nodeprobe::probe::StrategyKind;
use nodeprobe::probe_engine::ProbeEngine;
use nodeprobe::subscription::fetch_subscription;

#[derive(Parser, Debug)]
#[command(name = "nodeprobe", version)]
#[command(about = "Decode proxy share links and rank proxies by latency")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Control API address, e.g. http://127.0.0.1:9090
    #[arg(long, global = true)]
    controller: Option<String>,

    /// Control API secret
    #[arg(long, global = true)]
    secret: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a share link, file or subscription and print the descriptors
    Decode {
        /// Link, path, file:// or http(s):// URL, or - for stdin
        source: String,

        #[arg(short, long, value_enum, default_value_t = DecodeFormat::Yaml)]
        format: DecodeFormat,
    },
    /// Probe proxies and print them ranked by latency
    Probe {
        /// Subscription to take descriptors from (needed by simple and reliable)
        #[arg(short, long)]
        source: Option<String>,

        /// Comma separated proxy names; defaults to every known proxy
        #[arg(short, long, value_delimiter = ',')]
        names: Vec<String>,

        #[arg(long, value_enum, default_value_t = StrategyKind::Api)]
        strategy: StrategyKind,

        /// Switch selector groups to DIRECT while probing
        #[arg(long)]
        direct: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the default configuration
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = load_config(&args)?;

    match args.command {
        Command::Decode { ref source, format } => run_decode(source, format).await,
        Command::Probe {
            ref source,
            ref names,
            strategy,
            direct,
            json,
        } => {
            run_probe(config, source.as_deref(), names, strategy, direct, json, args.verbose).await
        }
        Command::InitConfig => {
            print!("{}", Config::generate_default_toml()?);
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path);
            Config::load_from_file(path)?
        }
        None => Config::default(),
    };
    if let Some(address) = &args.controller {
        config.controller.address = address.clone();
    }
    if let Some(secret) = &args.secret {
        config.controller.secret = Some(secret.clone());
    }
    Ok(config)
}

async fn load_bundle(source: &str) -> Result<DecodedBundle> {
    info!("Reading proxies from: {}", source);
    let content = fetch_subscription(source).await?;
    let bundle = decode_bundle(&content).with_context(|| format!("failed to decode {}", source))?;
    eprint!("{}", render_bundle_summary(&bundle));
    Ok(bundle)
}

async fn run_decode(source: &str, format: DecodeFormat) -> Result<()> {
    let bundle = load_bundle(source).await?;
    println!("{}", render_descriptors(&bundle.descriptors, format)?);
    Ok(())
}

async fn run_probe(
    config: Config,
    source: Option<&str>,
    names: &[String],
    strategy: StrategyKind,
    direct: bool,
    json: bool,
    verbose: bool,
) -> Result<()> {
    let descriptors: Vec<ProxyDescriptor> = match source {
        Some(source) => load_bundle(source).await?.descriptors,
        None => Vec::new(),
    };
    if descriptors.is_empty() && strategy != StrategyKind::Api {
        warn!("The {} strategy looks proxies up by name; pass --source", strategy);
    }

    let client = ControlClient::from_config(&config.controller)?;
    let mut engine = ProbeEngine::new(config)
        .with_controller(client)
        .with_descriptors(descriptors);
    if json {
        engine.register_reporter(Box::new(JsonReporter));
    } else {
        engine.register_reporter(Box::new(ConsoleReporter::new(verbose)));
    }

    let names = if names.is_empty() {
        engine.default_targets(strategy).await?
    } else {
        names.to_vec()
    };
    if names.is_empty() {
        bail!("nothing to probe");
    }

    let interrupt = interrupt_signal().await;
    let report = engine.run(&names, strategy, direct, interrupt).await?;
    if report.cancelled {
        warn!("Interrupted, partial run discarded");
    }
    Ok(())
}

/// Resolves on Ctrl-C. The handler is installed before this returns, so an
/// interrupt that arrives while direct mode is being entered is not lost.
async fn interrupt_signal() -> BoxFuture<'static, ()> {
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());
    match futures::poll!(ctrl_c.as_mut()) {
        Poll::Pending => ctrl_c.map(|_| ()).boxed(),
        Poll::Ready(Ok(())) => future::ready(()).boxed(),
        Poll::Ready(Err(e)) => {
            warn!("Cannot listen for Ctrl-C: {}", e);
            future::pending().boxed()
        }
    }
}
