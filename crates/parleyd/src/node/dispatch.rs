//! Per-connection read loop and inbound message handling.

use std::sync::Arc;

use tokio::sync::broadcast;

use parley_core::addr::{is_self_placeholder, split_host_port};
use parley_core::{wire, MessageId, PeerAddress, ProtocolMessage};

use super::{resolve, Node};
use crate::connection::{Connection, LineReader};

impl Node {
    /// Read lines until EOF, error, close or node shutdown, then unregister.
    pub(super) async fn read_loop(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut reader: LineReader,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        if conn.mark_hello_sent() {
            let hello = ProtocolMessage::hello(&self.username, self.listen_port());
            if let Err(e) = conn.send(&hello).await {
                tracing::debug!(peer = %conn.remote_address(), error = %e, "HELLO failed");
                conn.close().await;
            }
        }

        loop {
            if !self.is_running() {
                break;
            }
            let line = tokio::select! {
                _ = shutdown.recv() => break,
                line = reader.next_line() => line,
            };
            match line {
                Ok(Some(line)) => match wire::decode(&line) {
                    Ok(msg) => self.handle_message(&conn, msg).await,
                    Err(e) => {
                        tracing::debug!(peer = %conn.remote_address(), error = %e, "undecodable line");
                        self.history
                            .record_system(format!("bad message from {}: {e}", conn.remote_host()));
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(peer = %conn.remote_address(), error = %e, "read failed");
                    break;
                }
            }
        }

        self.registry.unregister(&conn);
        conn.close().await;
        tracing::debug!(peer = %conn.remote_address(), "connection closed");
        self.history
            .record_system(format!("connection closed with {}", conn.remote_host()));
    }

    async fn handle_message(self: &Arc<Self>, conn: &Arc<Connection>, msg: ProtocolMessage) {
        tracing::trace!(peer = %conn.remote_address(), tag = msg.tag().as_str(), "received");
        match &msg {
            ProtocolMessage::Hello {
                username,
                listen_port,
                ..
            } => self.on_hello(conn, username, *listen_port).await,
            ProtocolMessage::Msg { id, from, text } => {
                if !self.seen.insert(id) {
                    tracing::trace!(id = %id, "duplicate message dropped");
                    return;
                }
                self.on_chat(conn, from, text);
                if self.forward_enabled {
                    let relayed = self.broadcast(&msg, Some(conn)).await;
                    tracing::trace!(id = %id, peers = relayed, "message relayed");
                }
            }
            ProtocolMessage::PeersReq { id } => self.on_peers_req(conn, id).await,
            ProtocolMessage::PeersRes { peers, .. } => self.on_peers_res(conn, peers).await,
            ProtocolMessage::Bye { username, .. } => {
                let who = if username.trim().is_empty() {
                    conn.username()
                } else {
                    username.clone()
                };
                tracing::info!(peer = %conn.remote_address(), user = %who, "peer said goodbye");
                self.history.record_system(format!("{who} left"));
                conn.close().await;
            }
        }
    }

    /// Record the remote's identity and re-key the connection. A second
    /// live link to the same peer is settled here: one of the two closes.
    async fn on_hello(&self, conn: &Arc<Connection>, username: &str, listen_port: u16) {
        let listen_port = (listen_port > 0).then_some(listen_port);
        conn.set_remote_hello(username, listen_port);

        if let Some(port) = listen_port {
            self.add_known_peer(PeerAddress::from_ip(conn.remote_ip(), port));
        }

        let filing = self.registry.promote(conn, self.surviving_origin(conn));
        let Some(key) = self.settle_filing(conn, filing).await else {
            return;
        };

        tracing::info!(peer = %key, user = %conn.username(), "handshake complete");
        self.history
            .record_system(format!("{} joined from {}", conn.username(), conn.remote_address()));
    }

    fn on_chat(&self, conn: &Connection, from: &str, text: &str) {
        let from = if from.trim().is_empty() {
            conn.username()
        } else {
            from.to_string()
        };
        let entry = self.history.record_inbound(&from, text);
        self.display.display(&entry.format());
    }

    async fn on_peers_req(&self, conn: &Connection, request: &MessageId) {
        let reply = ProtocolMessage::peers_res(request.clone(), self.peer_list());
        if let Err(e) = conn.send(&reply).await {
            tracing::debug!(peer = %conn.remote_address(), error = %e, "PEERS_RES failed");
        }
    }

    /// Learn the advertised peers, then dial any we are not connected to in
    /// the background. Self-referring hosts are rewritten to the sender's
    /// actual address.
    async fn on_peers_res(self: &Arc<Self>, conn: &Connection, peers: &str) {
        for entry in peers.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (host, port) = match split_host_port(entry) {
                Ok(parts) => parts,
                Err(e) => {
                    tracing::debug!(peer = %conn.remote_address(), entry, error = %e, "bad peer entry");
                    self.history
                        .record_system(format!("ignoring peer entry '{entry}' from {}", conn.remote_host()));
                    continue;
                }
            };
            let addr = if is_self_placeholder(host) {
                PeerAddress::from_ip(conn.remote_ip(), port)
            } else {
                resolve(host, port).await
            };
            self.add_known_peer(addr);
        }

        self.spawn_connect_known_peers();
    }
}
