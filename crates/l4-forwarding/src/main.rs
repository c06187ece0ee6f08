//! Forwarding rule planner.
//!
//! Reads a Service and its existing forwarding rules from a JSON document
//! and prints the rule set the reconciler would converge to, without calling
//! the compute API.

use anyhow::{Context, Result};
use clap::Parser;
use l4_forwarding::{plan, ForwardingConfig, L4Namer, PlanInput};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Plan the forwarding rules of an L4 load balancer Service
#[derive(Parser, Debug)]
#[command(name = "fr-plan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Input document with the Service and existing rules, `-` for stdin
    #[arg(short = 'i', long, default_value = "-")]
    input: String,

    /// Override the discrete port forwarding flag of the configuration
    #[arg(long)]
    discrete_ports: Option<bool>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "warn")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read input from stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(input).with_context(|| format!("Failed to read input file {}", input))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match &args.config {
        Some(path) => ForwardingConfig::load(path)?,
        None => ForwardingConfig::default(),
    };
    let discrete = args
        .discrete_ports
        .unwrap_or(config.discrete_port_forwarding);
    debug!(?config, discrete, "Loaded configuration");

    let input: PlanInput =
        serde_json::from_str(&read_input(&args.input)?).context("Failed to parse input document")?;
    info!(service = %input.service, rules = input.rules.len(), "Planning forwarding rules");

    let plan = plan(&input, Arc::new(L4Namer::new(&config.cluster_uid)), discrete)
        .with_context(|| format!("Failed to plan forwarding rules for {}", input.service))?;
    if plan.l3_migration {
        info!("A temporary L3 forwarding rule would bracket this change");
    }

    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
