//! Live connection registry, keyed by `host:port`.
//!
//! A connection is filed under its provisional `host:sourcePort` key when it
//! opens and moved to `host:listenPort` once the remote's HELLO says where it
//! listens. Each connection remembers its current key so removal always hits
//! the right entry.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::connection::{Connection, Origin};

/// Where a connection ended up after `register` or `promote`.
#[derive(Debug)]
pub enum Filing {
    /// Filed under this key.
    Filed(String),
    /// Filed under the key in place of `displaced`, a live duplicate link to
    /// the same peer. The caller closes `displaced`.
    Displaced {
        key: String,
        displaced: Arc<Connection>,
    },
    /// A live duplicate already holds the key and stays. The caller closes
    /// the connection it tried to file.
    Rejected { key: String },
}

#[derive(Default)]
pub struct ConnectionRegistry {
    map: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// File `conn` under its provisional key.
    ///
    /// `keep` names which link wins if another live connection already holds
    /// the key; `None` keeps the existing one.
    pub fn register(&self, conn: &Arc<Connection>, keep: Option<Origin>) -> Filing {
        let key = conn.provisional_key();
        let filing = self.file(&key, conn, keep);
        if !matches!(filing, Filing::Rejected { .. }) {
            conn.set_key(key);
        }
        filing
    }

    /// Move `conn` to its `host:listenPort` key.
    ///
    /// No-op until the listen port is known or once the connection sits
    /// under that key. A live duplicate under the target key is settled by
    /// `keep` as in `register`.
    pub fn promote(&self, conn: &Arc<Connection>, keep: Option<Origin>) -> Filing {
        let current = conn.key();
        let target = match conn.promoted_key() {
            Some(target) if target != current => target,
            _ => return Filing::Filed(current),
        };

        let filing = self.file(&target, conn, keep);
        if !matches!(filing, Filing::Rejected { .. }) {
            self.map.remove_if(&current, |_, c| Arc::ptr_eq(c, conn));
            conn.set_key(target.clone());
            tracing::trace!(from = %current, to = %target, "connection key promoted");
        }
        filing
    }

    fn file(&self, key: &str, conn: &Arc<Connection>, keep: Option<Origin>) -> Filing {
        match self.map.entry(key.to_string()) {
            Entry::Occupied(mut slot) if !slot.get().is_closed() => {
                let existing = slot.get().clone();
                if Arc::ptr_eq(&existing, conn) {
                    return Filing::Filed(key.to_string());
                }
                let newcomer_wins =
                    keep.is_some_and(|k| conn.origin() == k && existing.origin() != k);
                if newcomer_wins {
                    slot.insert(conn.clone());
                    tracing::debug!(key, "duplicate link to peer, replacing the older one");
                    Filing::Displaced {
                        key: key.to_string(),
                        displaced: existing,
                    }
                } else {
                    tracing::debug!(key, "duplicate link to peer, keeping the older one");
                    Filing::Rejected {
                        key: key.to_string(),
                    }
                }
            }
            Entry::Occupied(mut stale) => {
                stale.insert(conn.clone());
                Filing::Filed(key.to_string())
            }
            Entry::Vacant(slot) => {
                slot.insert(conn.clone());
                Filing::Filed(key.to_string())
            }
        }
    }

    /// Remove `conn` if it is still the entry under its current key.
    pub fn unregister(&self, conn: &Arc<Connection>) -> bool {
        let key = conn.key();
        self.map.remove_if(&key, |_, c| Arc::ptr_eq(c, conn)).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.map.get(key).map(|c| c.value().clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Clones of every registered connection. Safe to hold across `.await`.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let keys: Vec<String> = self.map.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|k| self.map.remove(&k).map(|(_, c)| c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LineReader;
    use tokio::net::{TcpListener, TcpStream};

    /// A connection whose remote is a fresh client socket.
    async fn linked(listener: &TcpListener, origin: Origin) -> (Arc<Connection>, LineReader, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (conn, reader) = Connection::new(accepted.unwrap().0, origin).unwrap();
        (conn, reader, client.unwrap())
    }

    fn filed(filing: Filing) -> String {
        match filing {
            Filing::Filed(key) => key,
            other => panic!("expected Filed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_promote_unregister() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ConnectionRegistry::new();
        let (conn, _r, _c) = linked(&listener, Origin::Inbound).await;

        assert_eq!(filed(registry.register(&conn, None)), conn.provisional_key());
        assert!(registry.contains(&conn.provisional_key()));

        // Unknown listen port: nothing moves.
        assert_eq!(filed(registry.promote(&conn, None)), conn.provisional_key());

        conn.set_remote_hello("bob", Some(6000));
        assert_eq!(filed(registry.promote(&conn, None)), "127.0.0.1:6000");
        assert!(registry.contains("127.0.0.1:6000"));
        assert!(!registry.contains(&conn.provisional_key()));
        assert_eq!(registry.len(), 1);

        // Promotion happens once, even if the peer later claims another port.
        conn.set_remote_hello("bob", Some(7000));
        assert_eq!(filed(registry.promote(&conn, None)), "127.0.0.1:6000");
        assert!(!registry.contains("127.0.0.1:7000"));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(&conn));
        assert!(registry.is_empty());
        assert!(!registry.unregister(&conn));
    }

    #[tokio::test]
    async fn duplicate_link_without_preference_keeps_the_existing_one() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ConnectionRegistry::new();
        let (first, _r1, _c1) = linked(&listener, Origin::Inbound).await;
        let (second, _r2, _c2) = linked(&listener, Origin::Inbound).await;

        for conn in [&first, &second] {
            filed(registry.register(conn, None));
            conn.set_remote_hello("bob", Some(6000));
        }
        assert_eq!(filed(registry.promote(&first, None)), "127.0.0.1:6000");
        assert!(matches!(
            registry.promote(&second, Some(Origin::Inbound)),
            Filing::Rejected { .. }
        ));
        assert_eq!(second.key(), second.provisional_key());

        let held = registry.get("127.0.0.1:6000").unwrap();
        assert!(Arc::ptr_eq(&held, &first));

        // Removing the loser leaves the promoted entry alone.
        assert!(registry.unregister(&second));
        assert!(registry.contains("127.0.0.1:6000"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn preferred_origin_displaces_a_duplicate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ConnectionRegistry::new();
        let (dialed, _r1, _c1) = linked(&listener, Origin::Outbound).await;
        let (accepted, _r2, _c2) = linked(&listener, Origin::Inbound).await;
        let target = dialed.provisional_key();

        filed(registry.register(&dialed, None));
        filed(registry.register(&accepted, None));
        accepted.set_remote_hello("bob", Some(dialed.source_port()));

        match registry.promote(&accepted, Some(Origin::Inbound)) {
            Filing::Displaced { key, displaced } => {
                assert_eq!(key, target);
                assert!(Arc::ptr_eq(&displaced, &dialed));
            }
            other => panic!("expected Displaced, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&target).unwrap(), &accepted));

        // The displaced link no longer owns its old key.
        assert!(!registry.unregister(&dialed));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn closed_entries_are_replaced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ConnectionRegistry::new();
        let (first, _r1, _c1) = linked(&listener, Origin::Inbound).await;
        let (second, _r2, _c2) = linked(&listener, Origin::Inbound).await;
        for conn in [&first, &second] {
            filed(registry.register(conn, None));
            conn.set_remote_hello("bob", Some(6000));
        }
        filed(registry.promote(&first, None));
        first.close().await;

        assert_eq!(filed(registry.promote(&second, None)), "127.0.0.1:6000");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = ConnectionRegistry::new();
        let (a, _ra, _ca) = linked(&listener, Origin::Inbound).await;
        let (b, _rb, _cb) = linked(&listener, Origin::Inbound).await;
        registry.register(&a, None);
        registry.register(&b, None);

        assert_eq!(registry.snapshot().len(), 2);
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
