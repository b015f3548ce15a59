//! Kite Node - runs a Kite peer over TCP.
//!
//! The node answers the built-in `kite.*` methods and accepts Kontrol tokens
//! from the issuers it trusts, plus same-account `kiteKey` callers.

use anyhow::{Context, Result};
use clap::Parser;
use kite_core::{EnvConfig, KiteConfig, Node};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "kite-node")]
#[command(about = "Run a Kite node")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Kite name
    #[arg(long, default_value = "kite")]
    name: String,

    /// Kite version (MAJOR.MINOR.PATCH)
    #[arg(long = "kite-version", default_value = "1.0.0")]
    kite_version: String,

    /// Config file (defaults to ~/.kite/config.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trust an issuer's public key: ISSUER=PATH_TO_PEM (repeatable)
    #[arg(long = "trust", value_name = "ISSUER=PEM")]
    trust: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Map `KITE_LOG_LEVEL` names onto tracing levels.
fn parse_log_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => Some(Level::DEBUG),
        "INFO" | "NOTICE" => Some(Level::INFO),
        "WARNING" | "WARN" => Some(Level::WARN),
        "ERROR" | "CRITICAL" => Some(Level::ERROR),
        _ => None,
    }
}

fn parse_trust(entry: &str) -> Result<(String, PathBuf)> {
    let (issuer, path) = entry
        .split_once('=')
        .filter(|(issuer, path)| !issuer.is_empty() && !path.is_empty())
        .with_context(|| format!("--trust expects ISSUER=PEM_PATH, got {:?}", entry))?;
    Ok((issuer.to_string(), PathBuf::from(path)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug {
        Level::DEBUG
    } else {
        std::env::var(EnvConfig::LOG_LEVEL)
            .ok()
            .and_then(|v| parse_log_level(&v))
            .unwrap_or(Level::INFO)
    };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Starting Kite node");

    let config = KiteConfig::load(args.config.as_deref())?;
    let node = Node::new(&args.name, &args.kite_version, config)?;

    for entry in &args.trust {
        let (issuer, path) = parse_trust(entry)?;
        let key = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read key for {} from {}", issuer, path.display()))?;
        node.trust_issuer(issuer, key);
    }

    let handle = node
        .listen(format!("{}:{}", args.host, args.port))
        .await?;

    // Print port for launchers to read (intentional stdout for IPC)
    println!("KITE_PORT={}", handle.port);

    info!("Kite {} running on {}", node.kite(), handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
