//! parleyd — serverless LAN chat node.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use parley_core::addr::split_host_port;
use parley_core::config::ParleyConfig;
use parley_services::DisplaySink;
use parleyd::console::{self, parse_command};
use parleyd::{DiscoveryService, Node, NodeOptions};

/// Name used when none is configured and the prompt is left blank.
const ANONYMOUS: &str = "anon";

#[derive(Parser)]
#[command(author, version, about = "Serverless peer-to-peer chat for the local network", long_about = None)]
struct Cli {
    /// Display name sent to peers
    #[arg(short, long)]
    name: Option<String>,

    /// TCP port to accept peers on (0 = any free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Do not relay received messages to other peers
    #[arg(long)]
    no_forward: bool,

    /// Disable LAN multicast discovery
    #[arg(long)]
    no_discovery: bool,

    /// Peer to connect to at startup; repeatable
    #[arg(short, long, value_name = "HOST:PORT")]
    connect: Vec<String>,

    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.clone());
    if let Some(name) = cli.name {
        config.identity.username = name;
    }
    if let Some(port) = cli.port {
        config.network.listen_port = port;
    }
    if cli.no_forward {
        config.network.forward = false;
    }
    if cli.no_discovery {
        config.discovery.enabled = false;
    }
    if config.identity.username.trim().is_empty() {
        let answer = prompt("username: ")?;
        config.identity.username = if answer.is_empty() {
            ANONYMOUS.to_string()
        } else {
            answer
        };
    }

    let display: Arc<dyn DisplaySink> = Arc::new(|line: &str| println!("{line}"));
    let node = Node::new(NodeOptions::from_config(&config).with_display(display))?;
    let port = node.start().await.context("failed to start node")?;
    tracing::info!(port, forward = config.network.forward, "parleyd started");
    println!("{} listening on port {port}, /help for commands", node.username());

    let discovery = if config.discovery.enabled {
        match DiscoveryService::start(node.clone(), &config.discovery).await {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(error = %e, "discovery unavailable");
                node.history()
                    .record_system(format!("discovery unavailable: {e}"));
                println!("! discovery unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    for target in &cli.connect {
        match split_host_port(target) {
            Ok((host, port)) => node.connect_to(host, port).await?,
            Err(e) => println!("! ignoring --connect {target}: {e}"),
        }
    }

    // ── Console loop ─────────────────────────────────────────────────────────

    node.spawn_signal_hook();
    let mut shutdown_rx = node.subscribe_shutdown();
    let mut lines = stdin_lines();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            line = lines.recv() => {
                let Some(line) = line else { break };
                let Some(cmd) = parse_command(&line) else { continue };
                if console::execute(cmd, &node, discovery.as_ref()).await.is_break() {
                    break;
                }
            }
        }
    }

    if let Some(discovery) = &discovery {
        discovery.close().await;
    }
    node.shutdown().await;
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> ParleyConfig {
    let loaded = match path {
        Some(path) => ParleyConfig::load_from(path),
        None => {
            if let Err(e) = ParleyConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            ParleyConfig::load()
        }
    };
    loaded.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ParleyConfig::default()
    })
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read from stdin")?;
    Ok(answer.trim().to_string())
}

/// Console lines from a dedicated thread. Blocking stdin reads must not
/// hold up runtime shutdown; the channel closes on EOF.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}
