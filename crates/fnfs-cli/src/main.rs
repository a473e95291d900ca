#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use fnfs::{Credential, Cx, MountConfig, RequestEngine, SocketConnector, TransportKind, procs};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_PINGS: u32 = 4;

/// Create a `Cx` for CLI commands.
fn cli_cx() -> Cx {
    Cx::for_request()
}

/// `Cx` that gives up once `limit` has elapsed.
fn cli_cx_with_timeout(limit: Duration) -> Cx {
    Cx::with_timeout(limit)
}

#[derive(Debug, Serialize)]
struct ConfigSummary {
    servers: Vec<String>,
    transport: TransportKind,
    buffer_size: usize,
    read_size: usize,
    write_size: usize,
    readahead: usize,
    max_buffers: usize,
    max_delayed_writes: usize,
    max_outstanding_requests: usize,
    soft: bool,
    retrans: u32,
}

impl From<&MountConfig> for ConfigSummary {
    fn from(config: &MountConfig) -> Self {
        Self {
            servers: config.servers.clone(),
            transport: config.transport,
            buffer_size: config.buffer_size,
            read_size: config.read_size,
            write_size: config.write_size,
            readahead: config.readahead,
            max_buffers: config.max_buffers,
            max_delayed_writes: config.max_delayed_writes,
            max_outstanding_requests: config.max_outstanding_requests,
            soft: config.soft,
            retrans: config.retrans,
        }
    }
}

#[derive(Debug, Serialize)]
struct PingOutput {
    server: Option<String>,
    transport: TransportKind,
    sent: u32,
    replies: u32,
    retransmits: u64,
    min_ms: f64,
    avg_ms: f64,
    max_ms: f64,
}

fn main() {
    init_logging();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise log at info. Logs go to stderr so `--json`
/// output stays parseable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "check-config" => {
            let Some(path) = args.next() else {
                bail!("check-config requires a config path");
            };
            let json = args.any(|arg| arg == "--json");
            check_config(Path::new(&path), json)
        }
        "default-config" => default_config(),
        "ping" => {
            let Some(path) = args.next() else {
                bail!("ping requires a config path");
            };
            let remaining: Vec<String> = args.collect();
            let json = remaining.iter().any(|a| a == "--json");
            let count = parse_count(&remaining)?;
            ping(Path::new(&path), count, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("fnfs\n");
    println!("USAGE:");
    println!("  fnfs check-config <config.json> [--json]");
    println!("  fnfs default-config");
    println!("  fnfs ping <config.json> [--count N] [--json]");
}

fn parse_count(args: &[String]) -> Result<u32> {
    let Some(pos) = args.iter().position(|a| a == "--count") else {
        return Ok(DEFAULT_PINGS);
    };
    let Some(value) = args.get(pos + 1) else {
        bail!("--count requires a number");
    };
    let count: u32 = value
        .parse()
        .with_context(|| format!("invalid --count value {value:?}"))?;
    if count == 0 {
        bail!("--count must be at least 1");
    }
    Ok(count)
}

fn load(path: &Path) -> Result<MountConfig> {
    MountConfig::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn check_config(path: &Path, json: bool) -> Result<()> {
    let config = load(path)?;
    let summary = ConfigSummary::from(&config);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&config).context("serialize config")?
        );
        return Ok(());
    }
    println!("FrankenNFS mount configuration: OK");
    println!("servers: {}", summary.servers.join(", "));
    println!("transport: {:?}", summary.transport);
    println!(
        "io: buffer {} / read {} / write {} bytes, readahead {} blocks",
        summary.buffer_size, summary.read_size, summary.write_size, summary.readahead
    );
    println!(
        "cache: {} buffers, {} delayed writes max",
        summary.max_buffers, summary.max_delayed_writes
    );
    println!(
        "rpc: {} outstanding, {} mount, retrans {}",
        summary.max_outstanding_requests,
        if summary.soft { "soft" } else { "hard" },
        summary.retrans
    );
    Ok(())
}

fn default_config() -> Result<()> {
    let config = MountConfig::default();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("serialize config")?
    );
    Ok(())
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn ping(path: &Path, count: u32, json: bool) -> Result<()> {
    let config = load(path)?;
    let connect_cx = cli_cx_with_timeout(config.search_timeout + config.connect_timeout);
    let engine = RequestEngine::connect(
        &connect_cx,
        config.rpc_config(),
        config.transport_config(),
        Arc::new(SocketConnector::new(config.transport)),
    )
    .context("no server answered")?;
    info!(peer = ?engine.transport().peer(), "connected");

    let cx = cli_cx();
    let cred = Credential::default();
    let mut samples = Vec::with_capacity(count as usize);
    for seq in 0..count {
        let started = Instant::now();
        engine
            .call(&cx, procs::NULL, &cred, &[])
            .with_context(|| format!("NULL call {seq} failed"))?;
        let rtt = started.elapsed();
        debug!(seq, rtt_us = rtt.as_micros(), "reply");
        samples.push(rtt);
    }

    let stats = engine.stats();
    let peer = engine.transport().peer();
    engine.shutdown();

    let total: Duration = samples.iter().sum();
    let output = PingOutput {
        server: peer,
        transport: config.transport,
        sent: count,
        replies: u32::try_from(samples.len()).unwrap_or(u32::MAX),
        retransmits: stats.retransmits,
        min_ms: samples.iter().min().copied().map_or(0.0, millis),
        avg_ms: millis(total / count),
        max_ms: samples.iter().max().copied().map_or(0.0, millis),
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!(
            "{} ({:?}): {}/{} replies, rtt min/avg/max = {:.3}/{:.3}/{:.3} ms, {} retransmits",
            output.server.as_deref().unwrap_or("?"),
            output.transport,
            output.replies,
            output.sent,
            output.min_ms,
            output.avg_ms,
            output.max_ms,
            output.retransmits
        );
    }
    Ok(())
}
