//! One live peer connection.
//!
//! The TCP stream is split: the read half becomes a [`LineReader`] owned by
//! the connection's task, the write half stays in the shared [`Connection`]
//! behind a mutex so each protocol line goes out in one piece.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use parley_core::{wire, PeerAddress, ProtocolMessage};

/// Username shown for a peer until its HELLO arrives.
pub const UNKNOWN_USER: &str = "unknown";

/// How long `close` waits for an in-flight write before giving up on FIN.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

#[derive(Debug, Clone)]
struct RemoteIdentity {
    username: String,
    listen_port: Option<u16>,
}

pub struct Connection {
    local_ip: IpAddr,
    remote_ip: IpAddr,
    source_port: u16,
    origin: Origin,
    identity: RwLock<RemoteIdentity>,
    /// Registry key this connection is currently filed under.
    key: Mutex<String>,
    writer: tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    hello_sent: AtomicBool,
}

/// Read side of a connection. Yields `None` at end of stream or once the
/// connection is closed from anywhere.
pub struct LineReader {
    lines: Lines<BufReader<OwnedReadHalf>>,
    close_rx: watch::Receiver<bool>,
}

impl LineReader {
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        if *self.close_rx.borrow() {
            return Ok(None);
        }
        tokio::select! {
            _ = wait_closed(&mut self.close_rx) => Ok(None),
            line = self.lines.next_line() => line,
        }
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl Connection {
    pub fn new(stream: TcpStream, origin: Origin) -> io::Result<(std::sync::Arc<Self>, LineReader)> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(error = %e, "TCP_NODELAY failed");
        }
        let (read_half, write_half) = stream.into_split();
        let (close_tx, close_rx) = watch::channel(false);

        let remote = PeerAddress::from_socket_addr(peer);
        let remote_ip = remote.ip().unwrap_or(peer.ip());
        let local_ip = PeerAddress::from_socket_addr(local).ip().unwrap_or(local.ip());

        let conn = std::sync::Arc::new(Self {
            local_ip,
            remote_ip,
            source_port: peer.port(),
            origin,
            identity: RwLock::new(RemoteIdentity {
                username: UNKNOWN_USER.to_string(),
                listen_port: None,
            }),
            key: Mutex::new(remote.to_string()),
            writer: tokio::sync::Mutex::new(BufWriter::new(write_half)),
            closed: AtomicBool::new(false),
            close_tx,
            hello_sent: AtomicBool::new(false),
        });
        let reader = LineReader {
            lines: BufReader::new(read_half).lines(),
            close_rx,
        };
        Ok((conn, reader))
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    /// Our end of the socket, as the remote sees it on a flat network.
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    pub fn remote_host(&self) -> String {
        self.remote_ip.to_string()
    }

    /// The socket's remote port. For inbound connections this is ephemeral.
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn username(&self) -> String {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .username
            .clone()
    }

    /// The remote's self-reported listening port, once HELLO arrived.
    pub fn listen_port(&self) -> Option<u16> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listen_port
    }

    /// Record the remote's HELLO. Blank usernames stay "unknown". The first
    /// valid listen port sticks; later HELLOs cannot move it.
    pub fn set_remote_hello(&self, username: &str, listen_port: Option<u16>) {
        let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        identity.username = if username.trim().is_empty() {
            UNKNOWN_USER.to_string()
        } else {
            username.to_string()
        };
        if identity.listen_port.is_none() {
            identity.listen_port = listen_port.filter(|&p| p > 0);
        }
    }

    /// `host:sourcePort`, the key a connection is registered under before
    /// its HELLO is processed.
    pub fn provisional_key(&self) -> String {
        PeerAddress::from_ip(self.remote_ip, self.source_port).to_string()
    }

    /// `host:listenPort`, once known.
    pub fn promoted_key(&self) -> Option<String> {
        self.listen_port()
            .map(|port| PeerAddress::from_ip(self.remote_ip, port).to_string())
    }

    /// Where this peer can be reached: listening port if known, else the
    /// socket's remote port.
    pub fn remote_address(&self) -> PeerAddress {
        PeerAddress::from_ip(self.remote_ip, self.listen_port().unwrap_or(self.source_port))
    }

    pub(crate) fn key(&self) -> String {
        self.key.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_key(&self, key: String) {
        *self.key.lock().unwrap_or_else(PoisonError::into_inner) = key;
    }

    // ── I/O ──────────────────────────────────────────────────────────────────

    /// Claim the right to send our HELLO. True only for the first caller.
    pub fn mark_hello_sent(&self) -> bool {
        !self.hello_sent.swap(true, Ordering::SeqCst)
    }

    /// Write one message as a single line.
    pub async fn send(&self, msg: &ProtocolMessage) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        let mut line = wire::encode(msg);
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. Idempotent.
    ///
    /// Wakes the reader and half-closes the socket so the remote sees EOF.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_tx.send_replace(true);

        match tokio::time::timeout(CLOSE_GRACE, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    tracing::trace!(peer = %self.remote_address(), error = %e, "shutdown failed");
                }
            }
            Err(_) => tracing::debug!(peer = %self.remote_address(), "writer busy, skipping FIN"),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote_address())
            .field("source_port", &self.source_port)
            .field("origin", &self.origin)
            .field("username", &self.username())
            .field("closed", &self.is_closed())
            .finish()
    }
}
