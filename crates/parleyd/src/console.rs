//! Interactive console: slash commands and plain chat lines.

use std::ops::ControlFlow;
use std::sync::Arc;

use parley_core::addr::split_host_port;

use crate::discovery::DiscoveryService;
use crate::node::Node;

pub const HELP: &str = "\
commands:
  /connect <host> <port>   connect to a peer (also /connect host:port)
  /peers                   list connected peers
  /known                   list known peers
  /history                 print the session history
  /discover                send a LAN discovery announcement
  /help                    show this help
  /exit, /quit             leave the chat
anything else is sent to every connected peer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { host: String, port: u16 },
    Peers,
    Known,
    History,
    Discover,
    Help,
    Exit,
    Say(String),
    /// Bad input, with a message for the user.
    Invalid(String),
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Say(line.to_string()));
    }

    let mut words = line.split_whitespace();
    let name = words.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = words.collect();

    let cmd = match (name.as_str(), args.as_slice()) {
        ("/connect", [host, port]) => match port.parse::<u16>() {
            Ok(port) if port > 0 => Command::Connect {
                host: host.to_string(),
                port,
            },
            _ => Command::Invalid(format!("invalid port '{port}'")),
        },
        ("/connect", [addr]) => match split_host_port(addr) {
            Ok((_, 0)) => Command::Invalid(format!("invalid port in '{addr}'")),
            Ok((host, port)) => Command::Connect {
                host: host.to_string(),
                port,
            },
            Err(e) => Command::Invalid(e.to_string()),
        },
        ("/connect", _) => Command::Invalid("usage: /connect <host> <port>".to_string()),
        ("/peers", []) => Command::Peers,
        ("/known", []) => Command::Known,
        ("/history", []) => Command::History,
        ("/discover", []) => Command::Discover,
        ("/help", _) => Command::Help,
        ("/exit" | "/quit", _) => Command::Exit,
        ("/peers" | "/known" | "/history" | "/discover", _) => {
            Command::Invalid(format!("{name} takes no arguments"))
        }
        _ => Command::Invalid(format!("unknown command '{name}', try /help")),
    };
    Some(cmd)
}

/// Run one command against the node. `Break` means the user asked to leave.
pub async fn execute(
    cmd: Command,
    node: &Arc<Node>,
    discovery: Option<&Arc<DiscoveryService>>,
) -> ControlFlow<()> {
    match cmd {
        Command::Say(text) => {
            if let Err(e) = node.broadcast_user_text(&text).await {
                println!("! {e}");
            }
        }
        Command::Connect { host, port } => {
            if let Err(e) = node.connect_to(&host, port).await {
                println!("! {e}");
            }
        }
        Command::Peers => print_list("no peers connected", "connected peers", node.connected_peers()),
        Command::Known => print_list("no known peers", "known peers", node.known_peers()),
        Command::History => print!("{}", node.history().dump()),
        Command::Discover => match discovery {
            Some(d) if d.is_running() => {
                d.announce().await;
                if let Err(e) = node.connect_known_peers().await {
                    println!("! {e}");
                }
            }
            _ => println!("! discovery is disabled"),
        },
        Command::Help => println!("{HELP}"),
        Command::Invalid(msg) => println!("! {msg}"),
        Command::Exit => return ControlFlow::Break(()),
    }
    ControlFlow::Continue(())
}

fn print_list<T: std::fmt::Display>(empty: &str, title: &str, items: Vec<T>) {
    if items.is_empty() {
        println!("{empty}");
        return;
    }
    println!("{title} ({}):", items.len());
    for item in items {
        println!("  {item}");
    }
}
