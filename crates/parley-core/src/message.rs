//! Protocol messages — the five line types peers exchange over a connection.
//!
//! Every field here is carried unescaped. Escaping is a property of the
//! line format and lives in `wire.rs`.

use std::fmt;

// ── Message id ────────────────────────────────────────────────────────────────

/// Opaque, globally unique message identifier.
///
/// Freshly generated for every outgoing message except `PeersRes`, which
/// echoes the id of the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a new random id (UUID v4, hyphenated).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Tags ──────────────────────────────────────────────────────────────────────

/// The leading field of every protocol line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Hello,
    Msg,
    PeersReq,
    PeersRes,
    Bye,
}

impl MessageTag {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageTag::Hello => "HELLO",
            MessageTag::Msg => "MSG",
            MessageTag::PeersReq => "PEERS_REQ",
            MessageTag::PeersRes => "PEERS_RES",
            MessageTag::Bye => "BYE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HELLO" => Some(MessageTag::Hello),
            "MSG" => Some(MessageTag::Msg),
            "PEERS_REQ" => Some(MessageTag::PeersReq),
            "PEERS_RES" => Some(MessageTag::PeersRes),
            "BYE" => Some(MessageTag::Bye),
            _ => None,
        }
    }

    /// Number of `|`-separated fields a line with this tag carries,
    /// counting the tag itself.
    pub fn field_count(self) -> usize {
        match self {
            MessageTag::Hello => 4,
            MessageTag::Msg => 4,
            MessageTag::PeersReq => 2,
            MessageTag::PeersRes => 3,
            MessageTag::Bye => 3,
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// Identity announcement. Sent first on every connection, both directions.
    Hello {
        id: MessageId,
        username: String,
        listen_port: u16,
    },
    /// Chat payload. `id` is the dedup key across the whole mesh.
    Msg {
        id: MessageId,
        from: String,
        text: String,
    },
    /// Ask the remote for its known-peer list.
    PeersReq { id: MessageId },
    /// Answer to `PeersReq`; `id` echoes the request.
    /// `peers` is a comma-separated list of `host:port` entries.
    PeersRes { id: MessageId, peers: String },
    /// Graceful disconnect notice.
    Bye { id: MessageId, username: String },
}

impl ProtocolMessage {
    pub fn hello(username: impl Into<String>, listen_port: u16) -> Self {
        ProtocolMessage::Hello {
            id: MessageId::generate(),
            username: username.into(),
            listen_port,
        }
    }

    pub fn msg(from: impl Into<String>, text: impl Into<String>) -> Self {
        ProtocolMessage::Msg {
            id: MessageId::generate(),
            from: from.into(),
            text: text.into(),
        }
    }

    pub fn peers_req() -> Self {
        ProtocolMessage::PeersReq {
            id: MessageId::generate(),
        }
    }

    pub fn peers_res(request_id: MessageId, peers: impl Into<String>) -> Self {
        ProtocolMessage::PeersRes {
            id: request_id,
            peers: peers.into(),
        }
    }

    pub fn bye(username: impl Into<String>) -> Self {
        ProtocolMessage::Bye {
            id: MessageId::generate(),
            username: username.into(),
        }
    }

    pub fn id(&self) -> &MessageId {
        match self {
            ProtocolMessage::Hello { id, .. }
            | ProtocolMessage::Msg { id, .. }
            | ProtocolMessage::PeersReq { id }
            | ProtocolMessage::PeersRes { id, .. }
            | ProtocolMessage::Bye { id, .. } => id,
        }
    }

    pub fn tag(&self) -> MessageTag {
        match self {
            ProtocolMessage::Hello { .. } => MessageTag::Hello,
            ProtocolMessage::Msg { .. } => MessageTag::Msg,
            ProtocolMessage::PeersReq { .. } => MessageTag::PeersReq,
            ProtocolMessage::PeersRes { .. } => MessageTag::PeersRes,
            ProtocolMessage::Bye { .. } => MessageTag::Bye,
        }
    }
}
