use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use parley_core::PeerAddress;
use parley_services::{Direction, DisplaySink};
use parleyd::{Node, NodeOptions};

/// Upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

/// A running node plus everything its display sink has shown.
pub struct TestNode {
    pub node: Arc<Node>,
    shown: Arc<Mutex<Vec<String>>>,
}

impl TestNode {
    pub async fn spawn(name: &str) -> Result<Self> {
        Self::spawn_with(NodeOptions::new(name, 0)).await
    }

    pub async fn spawn_with(options: NodeOptions) -> Result<Self> {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let captured = shown.clone();
        let sink: Arc<dyn DisplaySink> = Arc::new(move |line: &str| {
            captured.lock().unwrap().push(line.to_string());
        });

        let node = Node::new(options.with_display(sink))?;
        node.start().await?;
        Ok(Self { node, shown })
    }

    pub fn port(&self) -> u16 {
        self.node.listen_port()
    }

    /// Where other loopback nodes see this one.
    pub fn address(&self) -> PeerAddress {
        PeerAddress::new("127.0.0.1", self.port())
    }

    pub async fn connect(&self, other: &TestNode) -> Result<()> {
        self.node.connect_to("127.0.0.1", other.port()).await?;
        Ok(())
    }

    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().unwrap().clone()
    }

    /// Texts of accepted inbound chat messages, oldest first.
    pub fn received(&self) -> Vec<String> {
        self.node
            .history()
            .entries_in(Direction::Inbound)
            .into_iter()
            .map(|e| e.text)
            .collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.node
            .history()
            .entries_in(Direction::System)
            .into_iter()
            .map(|e| e.text)
            .collect()
    }

    pub fn is_connected_to(&self, other: &TestNode) -> bool {
        self.node.connected_peers().contains(&other.address())
    }
}

/// Poll `cond` until it holds or `PATIENCE` runs out.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    loop {
        if cond() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Give in-flight messages time to arrive before asserting that something
/// did not happen.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

/// Wait until every pair in `nodes` is directly connected.
pub async fn wait_for_mesh(nodes: &[&TestNode]) -> Result<()> {
    wait_until("full mesh", || {
        nodes.iter().all(|a| {
            nodes
                .iter()
                .filter(|b| !std::ptr::eq(*a, **b))
                .all(|b| a.is_connected_to(b))
        })
    })
    .await
}
