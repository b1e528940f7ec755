//! # Stratum CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run an orchestrator over the instances listed in a manifest
//! stratum run -m services.json
//!
//! # Override the configuration file's strategy and region
//! stratum run -m services.json -c orchestrator.json --strategy least-connections --region eu-west
//!
//! # Check a manifest without starting anything
//! stratum validate -m services.json
//! ```
//!
//! Logging honours `RUST_LOG` and defaults to `info`.

use anyhow::{Context, Result};
use argh::FromArgs;
use std::sync::Arc;
use stratum_cli::{load_config, Manifest, TcpConnectCheck};
use stratum_metrics::TracingMetricsSink;
use stratum_orchestrator::{LoadBalancingStrategy, Orchestrator, OrchestratorConfig};

#[cfg(test)]
mod tests;

/// Stratum - service registry, load balancing and circuit breaking
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
    Validate(ValidateArgs),
}

/// Arguments for running an orchestrator.
///
/// Instances from the manifest are registered once the orchestrator has
/// started; health probes open a TCP connection to each instance's health
/// endpoint.
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// run an orchestrator over the instances in a manifest
struct RunArgs {
    /// path to the JSON manifest of service instances
    #[argh(option, short = 'm')]
    manifest: String,

    /// path to a JSON orchestrator configuration
    ///
    /// Keys left out of the file take their default values.
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// load balancing strategy: round-robin, weighted, least-connections or random
    ///
    /// Unknown names fall back to round-robin.
    #[argh(option)]
    strategy: Option<String>,

    /// region label reported in metrics
    #[argh(option)]
    region: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "validate")]
/// check a manifest and print the services it declares
struct ValidateArgs {
    /// path to the JSON manifest of service instances
    #[argh(option, short = 'm')]
    manifest: String,
}

/// Resolves the effective configuration: file (or defaults), then flag overrides.
fn resolve_config(args: &RunArgs) -> Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path).with_context(|| format!("loading config {}", path))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(strategy) = &args.strategy {
        config.strategy = LoadBalancingStrategy::parse_lenient(strategy);
    }
    if let Some(region) = &args.region {
        config.region = region.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let manifest = Manifest::from_path(&args.manifest)
        .with_context(|| format!("loading manifest {}", args.manifest))?;
    let config = resolve_config(&args)?;

    let orchestrator = Orchestrator::builder(config)
        .health_check(TcpConnectCheck::new())
        .metrics_sink(Arc::new(TracingMetricsSink::new()))
        .build()?;
    orchestrator.start().await;

    let mut registered = 0;
    for descriptor in manifest.services {
        if orchestrator.register_service(descriptor).await {
            registered += 1;
        }
    }
    tracing::info!("Registered {} instances from {}", registered, args.manifest);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");
    orchestrator.stop().await;
    Ok(())
}

fn validate(args: ValidateArgs) -> Result<()> {
    let manifest = Manifest::from_path(&args.manifest)
        .with_context(|| format!("validating manifest {}", args.manifest))?;
    for name in manifest.service_names() {
        let count = manifest.services.iter().filter(|s| s.name == name).count();
        println!("{}\t{}", name, count);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Set default log level to INFO, but allow RUST_LOG env var to override
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Validate(args) => validate(args),
    }
}
