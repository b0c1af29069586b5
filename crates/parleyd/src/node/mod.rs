//! The chat node: TCP listener, outbound dialer, connection registry,
//! known-peer set, dedup window and session history.
//!
//! Every connection gets its own task (see `dispatch`). All tasks hold a
//! clone of the worker guard; `shutdown` drops the node's copy and waits for
//! the guard channel to close, which happens when the last task exits.

mod dispatch;
pub mod registry;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use dashmap::DashSet;
use futures::future::{join_all, BoxFuture};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use parley_core::addr::is_self_placeholder;
use parley_core::config::{ParleyConfig, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_DEDUP_CAPACITY};
use parley_core::{MessageId, PeerAddress, ProtocolMessage};
use parley_services::{DisplaySink, MessageHistory, NullSink, SeenCache};

use crate::connection::{Connection, LineReader, Origin};
use crate::netif;
use registry::{ConnectionRegistry, Filing};

/// How long `shutdown` waits for connection tasks to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Per-connection budget for the farewell BYE.
const BYE_GRACE: Duration = Duration::from_millis(500);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node is not running")]
    NotRunning,
    #[error("node already started")]
    AlreadyStarted,
    #[error("invalid username '{0}': must be non-empty and on one line")]
    InvalidUsername(String),
    #[error("failed to bind TCP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

pub struct NodeOptions {
    pub username: String,
    /// 0 = OS-assigned.
    pub listen_port: u16,
    pub forward_enabled: bool,
    pub connect_timeout: Duration,
    pub dedup_capacity: usize,
    pub history: MessageHistory,
    pub display: Arc<dyn DisplaySink>,
}

impl NodeOptions {
    pub fn new(username: impl Into<String>, listen_port: u16) -> Self {
        Self {
            username: username.into(),
            listen_port,
            forward_enabled: true,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            history: MessageHistory::new(),
            display: Arc::new(NullSink),
        }
    }

    pub fn from_config(config: &ParleyConfig) -> Self {
        Self {
            forward_enabled: config.network.forward,
            connect_timeout: Duration::from_millis(config.network.connect_timeout_ms),
            dedup_capacity: config.network.dedup_capacity,
            ..Self::new(config.identity.username.clone(), config.network.listen_port)
        }
    }

    pub fn with_display(mut self, display: Arc<dyn DisplaySink>) -> Self {
        self.display = display;
        self
    }
}

pub struct Node {
    username: String,
    requested_port: u16,
    listen_port: AtomicU16,
    forward_enabled: bool,
    connect_timeout: Duration,

    registry: ConnectionRegistry,
    known: DashSet<PeerAddress>,
    seen: SeenCache,
    history: MessageHistory,
    display: Arc<dyn DisplaySink>,
    local_ips: OnceLock<Vec<IpAddr>>,

    started: AtomicBool,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    worker_guard: Mutex<Option<mpsc::Sender<()>>>,
    workers_done: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    /// Flips to true once teardown has finished.
    stopped: watch::Sender<bool>,
}

impl Node {
    pub fn new(options: NodeOptions) -> Result<Arc<Self>, NodeError> {
        let username = options.username.trim().to_string();
        if username.is_empty() || username.contains(['\n', '\r']) {
            return Err(NodeError::InvalidUsername(options.username));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let (guard_tx, guard_rx) = mpsc::channel(1);
        let (stopped, _) = watch::channel(false);

        Ok(Arc::new(Self {
            username,
            requested_port: options.listen_port,
            listen_port: AtomicU16::new(options.listen_port),
            forward_enabled: options.forward_enabled,
            connect_timeout: options.connect_timeout,
            registry: ConnectionRegistry::new(),
            known: DashSet::new(),
            seen: SeenCache::new(options.dedup_capacity),
            history: options.history,
            display: options.display,
            local_ips: OnceLock::new(),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_tx,
            worker_guard: Mutex::new(Some(guard_tx)),
            workers_done: tokio::sync::Mutex::new(Some(guard_rx)),
            stopped,
        }))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Bind the listener and start accepting. Returns the bound port.
    pub async fn start(self: &Arc<Self>) -> Result<u16, NodeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }

        let bind = |source| NodeError::Bind {
            port: self.requested_port,
            source,
        };
        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.requested_port)).await {
            Ok(l) => l,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(bind(e));
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(bind(e));
            }
        };

        self.listen_port.store(port, Ordering::SeqCst);
        let _ = self.local_ips.set(netif::local_addresses());
        self.running.store(true, Ordering::SeqCst);

        let shutdown = self.shutdown_tx.subscribe();
        let node = self.clone();
        self.spawn_worker(Box::pin(async move { node.accept_loop(listener, shutdown).await }));

        tracing::info!(port, username = %self.username, "node listening");
        self.history
            .record_system(format!("listening on port {port} as {}", self.username));
        Ok(port)
    }

    /// Stop the node: BYE to every peer, close all connections, stop the
    /// listener, wait (bounded) for connection tasks. Idempotent; a caller
    /// that loses the race returns once the winner's teardown is done.
    pub async fn shutdown(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if self.started.load(Ordering::SeqCst) {
                let done = wait_stopped(self.stopped.subscribe());
                if tokio::time::timeout(SHUTDOWN_GRACE + BYE_GRACE, done).await.is_err() {
                    tracing::warn!("gave up waiting for shutdown to finish");
                }
            }
            return;
        }
        tracing::info!("node shutting down");

        let conns = self.registry.drain();
        let bye = ProtocolMessage::bye(&self.username);
        join_all(conns.iter().map(|conn| {
            let bye = &bye;
            async move {
                match tokio::time::timeout(BYE_GRACE, conn.send(bye)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(peer = %conn.remote_address(), error = %e, "BYE failed"),
                    Err(_) => tracing::debug!(peer = %conn.remote_address(), "BYE timed out"),
                }
                conn.close().await;
            }
        }))
        .await;

        let _ = self.shutdown_tx.send(());
        drop(
            self.worker_guard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let done = self.workers_done.lock().await.take();
        if let Some(mut done) = done {
            match tokio::time::timeout(SHUTDOWN_GRACE, done.recv()).await {
                Ok(_) => tracing::debug!("all connection tasks stopped"),
                Err(_) => tracing::warn!("connection tasks still running after shutdown grace"),
            }
        }

        self.history.record_system("node stopped");
        self.stopped.send_replace(true);
    }

    /// Run `shutdown` on Ctrl-C (and SIGTERM on Unix).
    pub fn spawn_signal_hook(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            node.shutdown().await;
        })
    }

    /// Fires once when `shutdown` begins tearing down workers.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Bound port once started; the requested port before that.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Reachable addresses of live connections, sorted and deduplicated.
    pub fn connected_peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .registry
            .snapshot()
            .iter()
            .filter(|c| !c.is_closed())
            .map(|c| c.remote_address())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn known_peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self.known.iter().map(|p| p.key().clone()).collect();
        peers.sort();
        peers
    }

    /// True when `addr` names this node.
    pub fn is_self(&self, addr: &PeerAddress) -> bool {
        if addr.port() != self.listen_port() {
            return false;
        }
        if is_self_placeholder(addr.host()) {
            return true;
        }
        match (addr.ip(), self.local_ips.get()) {
            (Some(ip), Some(locals)) => locals.contains(&ip),
            _ => false,
        }
    }

    // ── Peers ────────────────────────────────────────────────────────────────

    /// Remember a peer for later dialing. Self addresses are refused.
    pub fn add_known_peer(&self, addr: PeerAddress) -> bool {
        if self.is_self(&addr) {
            tracing::trace!(peer = %addr, "not recording self as known peer");
            return false;
        }
        let added = self.known.insert(addr.clone());
        if added {
            tracing::debug!(peer = %addr, "known peer added");
        }
        added
    }

    /// Dial every known peer that has no live connection, all at once.
    pub async fn connect_known_peers(self: &Arc<Self>) -> Result<(), NodeError> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }
        let targets: Vec<PeerAddress> = self
            .known
            .iter()
            .map(|p| p.key().clone())
            .filter(|p| !self.registry.contains(&p.to_string()))
            .collect();
        join_all(targets.iter().map(|t| self.connect_to(t.host(), t.port())))
            .await
            .into_iter()
            .collect()
    }

    /// `connect_known_peers` on a tracked worker, for callers that must keep
    /// reading their socket while the dials run.
    pub fn spawn_connect_known_peers(self: &Arc<Self>) {
        let node = self.clone();
        self.spawn_worker(Box::pin(async move {
            if let Err(e) = node.connect_known_peers().await {
                tracing::debug!(error = %e, "auto-connect skipped");
            }
        }));
    }

    /// Open an outbound connection unless `host:port` is this node or is
    /// already connected. Dial failures become history notices.
    pub async fn connect_to(self: &Arc<Self>, host: &str, port: u16) -> Result<(), NodeError> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }

        let target = resolve(host, port).await;
        if self.is_self(&target) {
            tracing::debug!(peer = %target, "skipping connection to self");
            return Ok(());
        }
        if self.registry.contains(&target.to_string()) {
            tracing::trace!(peer = %target, "already connected");
            return Ok(());
        }

        let dial = TcpStream::connect((target.host(), target.port()));
        let stream = match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.notice(format!("could not connect to {target}: {e}"));
                return Ok(());
            }
            Err(_) => {
                self.notice(format!("could not connect to {target}: timed out"));
                return Ok(());
            }
        };
        if !self.is_running() {
            return Ok(());
        }

        let (conn, reader) = match Connection::new(stream, Origin::Outbound) {
            Ok(pair) => pair,
            Err(e) => {
                self.notice(format!("could not connect to {target}: {e}"));
                return Ok(());
            }
        };
        let filing = self.registry.register(&conn, self.surviving_origin(&conn));
        if self.settle_filing(&conn, filing).await.is_none() {
            return Ok(());
        }
        if !self.introduce(&conn, &target).await {
            return Ok(());
        }

        tracing::info!(peer = %target, "connected");
        self.history.record_system(format!("connected to {target}"));
        self.spawn_reader(conn, reader);
        Ok(())
    }

    /// Send HELLO then PEERS_REQ on a fresh outbound link. On failure the
    /// link is dropped and the dial is reported as failed.
    async fn introduce(&self, conn: &Arc<Connection>, target: &PeerAddress) -> bool {
        conn.mark_hello_sent();
        let hello = ProtocolMessage::hello(&self.username, self.listen_port());
        for msg in [hello, ProtocolMessage::peers_req()] {
            if let Err(e) = conn.send(&msg).await {
                tracing::warn!(peer = %target, error = %e, "handshake write failed");
                self.registry.unregister(conn);
                conn.close().await;
                self.notice(format!("could not connect to {target}: {e}"));
                return false;
            }
        }
        true
    }

    /// Which of two live links to one peer survives: the one dialed by the
    /// side with the lower (ip, listen port). Both ends compute the same
    /// answer. `None` while the peer's listen port is unknown.
    fn surviving_origin(&self, conn: &Connection) -> Option<Origin> {
        let peer_port = match conn.origin() {
            Origin::Outbound => conn.listen_port().unwrap_or(conn.source_port()),
            Origin::Inbound => conn.listen_port()?,
        };
        let ours = (conn.local_ip(), self.listen_port());
        let theirs = (conn.remote_ip(), peer_port);
        Some(if ours < theirs {
            Origin::Outbound
        } else {
            Origin::Inbound
        })
    }

    /// Close whichever link lost a registry filing. Returns the key `conn`
    /// sits under, or `None` if `conn` itself was closed.
    async fn settle_filing(&self, conn: &Arc<Connection>, filing: Filing) -> Option<String> {
        match filing {
            Filing::Filed(key) => Some(key),
            Filing::Displaced { key, displaced } => {
                tracing::info!(peer = %key, "dropping duplicate link");
                displaced.close().await;
                Some(key)
            }
            Filing::Rejected { key } => {
                tracing::info!(peer = %key, "dropping duplicate link");
                conn.close().await;
                None
            }
        }
    }

    // ── Chat ─────────────────────────────────────────────────────────────────

    /// Send a chat line to every connected peer and record it locally.
    pub async fn broadcast_user_text(&self, text: &str) -> Result<MessageId, NodeError> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }
        let text = text.replace(['\r', '\n'], " ");
        let msg = ProtocolMessage::msg(&self.username, text.as_str());
        self.seen.insert(msg.id());
        self.history.record_outbound(&self.username, &text);

        let sent = self.broadcast(&msg, None).await;
        tracing::debug!(id = %msg.id(), peers = sent, "chat message sent");
        Ok(msg.id().clone())
    }

    /// Write `msg` to every live connection except `except`. A failed write
    /// tears that connection down. Returns how many writes succeeded.
    async fn broadcast(&self, msg: &ProtocolMessage, except: Option<&Arc<Connection>>) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|c| !c.is_closed())
            .filter(|c| except.map_or(true, |e| !Arc::ptr_eq(c, e)))
            .collect();

        let results = join_all(targets.iter().map(|c| c.send(msg))).await;

        let mut sent = 0;
        for (conn, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(peer = %conn.remote_address(), error = %e, "send failed, dropping connection");
                    conn.close().await;
                }
            }
        }
        sent
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// History notice, mirrored to the log.
    fn notice(&self, text: String) {
        tracing::info!("{text}");
        self.history.record_system(text);
    }

    /// Peers we advertise in a PEERS_RES: ourselves as `localhost`, then known
    /// and connected peers, without repeats.
    fn peer_list(&self) -> String {
        let mut out = vec![format!("localhost:{}", self.listen_port())];
        let known = self.known.iter().map(|p| p.key().to_string());
        let connected = self.connected_peers().into_iter().map(|p| p.to_string());
        for entry in known.collect::<Vec<_>>().into_iter().chain(connected) {
            if !out.contains(&entry) {
                out.push(entry);
            }
        }
        out.join(",")
    }

    /// Spawn a tracked task. Tasks started after shutdown still run but are
    /// not waited for.
    fn spawn_worker(&self, task: BoxFuture<'static, ()>) {
        let guard = self
            .worker_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tokio::spawn(async move {
            task.await;
            drop(guard);
        });
    }

    fn spawn_reader(self: &Arc<Self>, conn: Arc<Connection>, reader: LineReader) {
        let node = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.spawn_worker(Box::pin(async move {
            node.read_loop(conn, reader, shutdown).await
        }));
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            if !self.is_running() {
                break;
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.on_accept(stream, addr).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        self.history.record_system(format!("accept failed: {e}"));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        tracing::debug!("accept loop stopped");
    }

    async fn on_accept(self: &Arc<Self>, stream: TcpStream, addr: std::net::SocketAddr) {
        if !self.is_running() {
            return;
        }
        let (conn, reader) = match Connection::new(stream, Origin::Inbound) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "dropping accepted connection");
                return;
            }
        };
        let filing = self.registry.register(&conn, None);
        if self.settle_filing(&conn, filing).await.is_none() {
            return;
        }

        tracing::debug!(peer = %addr, "accepted connection");
        self.history
            .record_system(format!("incoming connection from {}", conn.remote_host()));
        self.spawn_reader(conn, reader);
    }
}

async fn wait_stopped(mut stopped: watch::Receiver<bool>) {
    loop {
        let done = *stopped.borrow_and_update();
        if done || stopped.changed().await.is_err() {
            return;
        }
    }
}

/// Resolve `host` without blocking the runtime. Unresolvable names are kept
/// verbatim so the dial reports the failure.
async fn resolve(host: &str, port: u16) -> PeerAddress {
    let bare = host.trim().trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return PeerAddress::unresolved(bare, port);
    }
    match tokio::net::lookup_host((bare, port)).await {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.collect();
            addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .map(|a| PeerAddress::from_socket_addr(*a))
                .unwrap_or_else(|| PeerAddress::unresolved(bare, port))
        }
        Err(e) => {
            tracing::debug!(host = bare, error = %e, "name resolution failed");
            PeerAddress::unresolved(bare, port)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
