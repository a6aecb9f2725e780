//! # RPC Proxy CLI
//!
//! Operational tool for checking a proxy configuration against a live
//! downstream server.
//!
//! ## Usage
//!
//! ```bash
//! # Initialize a proxy, borrow 4 connections at once, print pool stats
//! rpcproxy probe -m calculator.json --host svc.internal -p 9090 -t 500 -c 4
//!
//! # Same, with settings loaded from a JSON config file
//! rpcproxy probe -m calculator.json --config proxy.json
//!
//! # List the procedures a manifest resolves to
//! rpcproxy procedures -m calculator.json
//! ```

mod manifest;

use anyhow::Result;
use argh::FromArgs;
use rpcproxy_proxy::{LifecycleContext, MethodRegistry, Proxy, ProxyConfig};
use serde_json::json;
use std::sync::Arc;

use crate::manifest::ServiceManifest;

#[derive(FromArgs)]
/// rpcproxy - pooled client-side proxy for one RPC service
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Probe(ProbeArgs),
    Procedures(ProceduresArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "probe")]
/// initialize a proxy and exercise its connection pool
struct ProbeArgs {
    /// path to the service manifest JSON
    #[argh(option, short = 'm')]
    manifest: String,

    /// optional JSON proxy config; flags override its fields
    #[argh(option)]
    config: Option<String>,

    /// downstream server host
    #[argh(option)]
    host: Option<String>,

    /// downstream server port
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// per-call timeout in milliseconds
    #[argh(option, short = 't')]
    timeout_ms: Option<u64>,

    /// maximum pool size
    #[argh(option)]
    pool_size: Option<usize>,

    /// maximum time to wait for a pooled connection in milliseconds
    #[argh(option)]
    max_wait_ms: Option<u64>,

    /// number of connections to borrow concurrently
    #[argh(option, short = 'c', default = "4")]
    concurrency: usize,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "procedures")]
/// list the procedures declared by a service manifest
struct ProceduresArgs {
    /// path to the service manifest JSON
    #[argh(option, short = 'm')]
    manifest: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // `procedures` output is meant for piping, keep it free of logs
    if matches!(cli.command, Commands::Probe(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Probe(args) => run_probe(args).await,
        Commands::Procedures(args) => run_procedures(args),
    }
}

/// Merges the config file (if any) with command-line overrides.
fn build_config(args: &ProbeArgs, manifest: &ServiceManifest) -> Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_json_file(path)?,
        None => ProxyConfig::default(),
    };

    if let Some(host) = &args.host {
        config.host = Some(host.clone());
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = Some(timeout_ms);
    }
    if let Some(pool_size) = args.pool_size {
        config.pool.max_size = pool_size;
    }
    if let Some(max_wait_ms) = args.max_wait_ms {
        config.pool.max_wait_ms = max_wait_ms;
    }
    config.service = Some(manifest.service.clone());

    Ok(config)
}

async fn run_probe(args: ProbeArgs) -> Result<()> {
    let manifest = ServiceManifest::from_file(&args.manifest)?;
    let config = build_config(&args, &manifest)?;
    tracing::info!("Probing {} procedures of {}", manifest.procedures.len(), manifest.service);

    let mut proxy = Proxy::new(config, Arc::new(manifest.into_catalog()));
    let context = LifecycleContext::new().with_property("command", "probe");
    proxy.validate()?;
    proxy.initialize(&context)?;

    let borrows = (0..args.concurrency).map(|_| proxy.borrow_connection());
    let results = futures::future::join_all(borrows).await;

    let mut borrowed = 0;
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(conn) => {
                borrowed += 1;
                proxy.release_connection(conn, true)?;
            }
            Err(e) => {
                tracing::warn!("Borrow failed: {}", e);
                errors.push(e.to_string());
            }
        }
    }

    let report = json!({
        "service": proxy.name(),
        "procedures": proxy.procedure_names(),
        "borrowed": borrowed,
        "errors": errors,
        "pool": proxy.pool_stats(),
    });
    proxy.shutdown(&context)?;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if borrowed == 0 && args.concurrency > 0 {
        anyhow::bail!("No connection could be borrowed from {}", proxy.name());
    }
    Ok(())
}

fn run_procedures(args: ProceduresArgs) -> Result<()> {
    let manifest = ServiceManifest::from_file(&args.manifest)?;
    let service = manifest.service.clone();
    let catalog = manifest.into_catalog();

    let registry = MethodRegistry::build(&service, &catalog)?;
    for name in registry.procedure_names() {
        println!("{}", name);
    }
    Ok(())
}
