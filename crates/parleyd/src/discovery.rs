//! LAN discovery over IPv4 multicast.
//!
//! Every node joins the same group and port. `announce` multicasts a
//! DISCOVER; anyone hearing it records the sender and answers with a unicast
//! HERE. Both kinds of datagram feed the node's known-peer set, after which
//! the node dials whatever it is not yet connected to.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use parley_core::config::DiscoveryConfig;
use parley_core::{DatagramKind, DiscoveryDatagram, PeerAddress};

use crate::node::Node;

const MAX_DATAGRAM: usize = 2048;
/// Pause after a failed receive.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid multicast group '{0}'")]
    InvalidGroup(String),
    #[error("{op}: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

trait SocketContext<T> {
    fn op(self, op: &'static str) -> Result<T, DiscoveryError>;
}

impl<T> SocketContext<T> for io::Result<T> {
    fn op(self, op: &'static str) -> Result<T, DiscoveryError> {
        self.map_err(|source| DiscoveryError::Socket { op, source })
    }
}

pub struct DiscoveryService {
    node: Arc<Node>,
    socket: UdpSocket,
    group: Ipv4Addr,
    port: u16,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Join the group, start listening, and send the first DISCOVER.
    pub async fn start(node: Arc<Node>, config: &DiscoveryConfig) -> Result<Arc<Self>, DiscoveryError> {
        let group: Ipv4Addr = config
            .group
            .trim()
            .parse()
            .map_err(|_| DiscoveryError::InvalidGroup(config.group.clone()))?;
        if !group.is_multicast() {
            return Err(DiscoveryError::InvalidGroup(config.group.clone()));
        }

        let socket = make_multicast_socket(group, config.port)?;
        let socket = UdpSocket::from_std(socket).op("register with runtime")?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let service = Arc::new(Self {
            node,
            socket,
            group,
            port: config.port,
            running: AtomicBool::new(true),
            shutdown_tx,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(
            service.clone().listen_loop(service.shutdown_tx.subscribe()),
        )];
        if config.announce_interval_secs > 0 {
            let every = Duration::from_secs(config.announce_interval_secs);
            tasks.push(tokio::spawn(
                service.clone().announce_loop(every, service.shutdown_tx.subscribe()),
            ));
        }
        *service.tasks.lock().await = tasks;

        tracing::info!(group = %group, port = config.port, "discovery started");
        service.announce().await;
        Ok(service)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Multicast a DISCOVER. Failures become history notices.
    pub async fn announce(&self) {
        if !self.is_running() {
            return;
        }
        let payload = DiscoveryDatagram::discover(self.node.listen_port(), self.node.username()).encode();
        let dest = SocketAddrV4::new(self.group, self.port);
        match self.socket.send_to(payload.as_bytes(), dest).await {
            Ok(_) => tracing::debug!(group = %dest, "discovery announcement sent"),
            Err(e) => {
                tracing::warn!(group = %dest, error = %e, "discovery announcement failed");
                self.node
                    .history()
                    .record_system(format!("discovery announcement failed: {e}"));
            }
        }
    }

    /// Leave the group and stop the workers. Idempotent.
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.socket.leave_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED) {
            tracing::debug!(error = %e, "IP_DROP_MEMBERSHIP failed");
        }
        let _ = self.shutdown_tx.send(());

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "discovery task ended abnormally");
            }
        }
        tracing::info!("discovery stopped");
    }

    async fn listen_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if !self.is_running() {
                break;
            }
            let (len, from) = tokio::select! {
                _ = shutdown.recv() => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        recv_failed(e).await;
                        continue;
                    }
                },
            };
            self.handle_datagram(&buf[..len], from).await;
        }
        tracing::debug!("discovery listener stopped");
    }

    async fn announce_loop(self: Arc<Self>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; `start` already announced.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => self.announce().await,
            }
        }
    }

    async fn handle_datagram(&self, payload: &[u8], from: SocketAddr) {
        let decoded = std::str::from_utf8(payload)
            .map_err(|_| "not UTF-8".to_string())
            .and_then(|text| DiscoveryDatagram::decode(text).map_err(|e| e.to_string()));
        let datagram = match decoded {
            Ok(d) => d,
            Err(reason) => {
                tracing::debug!(from = %from, reason = %reason, "malformed discovery datagram");
                self.node
                    .history()
                    .record_system(format!("ignored discovery datagram from {}: {reason}", from.ip()));
                return;
            }
        };

        let peer = PeerAddress::from_ip(from.ip(), datagram.listen_port);
        if self.node.is_self(&peer) {
            tracing::trace!("ignoring own announcement");
            return;
        }
        tracing::debug!(peer = %peer, user = %datagram.username, kind = datagram.kind.as_str(), "peer discovered");
        self.node.add_known_peer(peer);

        if datagram.kind == DatagramKind::Discover {
            let reply = DiscoveryDatagram::here(self.node.listen_port(), self.node.username()).encode();
            if let Err(e) = self.socket.send_to(reply.as_bytes(), from).await {
                tracing::debug!(to = %from, error = %e, "HERE reply failed");
                self.node
                    .history()
                    .record_system(format!("discovery reply to {} failed: {e}", from.ip()));
            }
        }

        self.node.spawn_connect_known_peers();
    }
}

/// Log a failed receive and back off so a persistent error cannot spin.
async fn recv_failed(e: io::Error) {
    tracing::warn!(error = %e, "recv_from failed");
    tokio::time::sleep(RECV_BACKOFF).await;
}

/// A UDP socket bound to the discovery port and joined to `group`.
fn make_multicast_socket(group: Ipv4Addr, port: u16) -> Result<std::net::UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).op("socket()")?;

    socket.set_reuse_address(true).op("SO_REUSEADDR")?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).op("SO_REUSEPORT")?;
    socket.set_nonblocking(true).op("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).op("bind()")?;

    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .op("IP_ADD_MEMBERSHIP")?;
    socket.set_multicast_loop_v4(true).op("IP_MULTICAST_LOOP")?;
    socket.set_multicast_ttl_v4(1).op("IP_MULTICAST_TTL")?;

    Ok(socket.into())
}
