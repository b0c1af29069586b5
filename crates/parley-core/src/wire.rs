//! Parley wire format — one UTF-8 line per message, `|`-separated fields.
//!
//! ```text
//! HELLO|<id>|<username>|<listenPort>
//! MSG|<id>|<from>|<text>
//! PEERS_REQ|<id>
//! PEERS_RES|<id>|<host:port,host:port,...>
//! BYE|<id>|<username>
//! ```
//!
//! Inside any text field a literal `\` is sent as `\\` and a literal `|` as
//! `\|`. The receiver splits on unescaped separators first, then unescapes
//! each field on its own.
//!
//! The same field rules apply to discovery datagrams:
//!
//! ```text
//! DISCOVER|<listenPort>|<username>
//! HERE|<listenPort>|<username>
//! ```

use crate::message::{MessageId, MessageTag, ProtocolMessage};

pub const FIELD_SEPARATOR: char = '|';
pub const ESCAPE: char = '\\';

// ── Errors ────────────────────────────────────────────────────────────────────

/// A line (or datagram) that could not be decoded.
///
/// Always local to the offending line. The reader logs it and moves on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty protocol line")]
    Empty,
    #[error("unknown message type '{0}'")]
    UnknownTag(String),
    #[error("invalid {tag}: expected {expected} fields, found {found}")]
    MissingFields {
        tag: String,
        expected: usize,
        found: usize,
    },
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

// ── Field escaping ────────────────────────────────────────────────────────────

/// Escape a free-text field: backslashes first, then separators.
pub fn escape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == ESCAPE || c == FIELD_SEPARATOR {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Reverse of [`escape_field`]. A trailing lone escape is kept literally.
pub fn unescape_field(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaping = false;
    for c in s.chars() {
        if escaping {
            out.push(c);
            escaping = false;
        } else if c == ESCAPE {
            escaping = true;
        } else {
            out.push(c);
        }
    }
    if escaping {
        out.push(ESCAPE);
    }
    out
}

/// Split a line on separators that are not preceded by an escape.
/// The returned slices are still escaped.
pub fn split_fields(line: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut escaping = false;
    for (i, c) in line.char_indices() {
        if escaping {
            escaping = false;
        } else if c == ESCAPE {
            escaping = true;
        } else if c == FIELD_SEPARATOR {
            fields.push(&line[start..i]);
            start = i + c.len_utf8();
        }
    }
    fields.push(&line[start..]);
    fields
}

fn join_fields(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join("|")
}

fn parse_port(raw: &str) -> Result<u16, WireError> {
    raw.trim()
        .parse()
        .map_err(|_| WireError::InvalidPort(raw.to_string()))
}

// ── Protocol lines ────────────────────────────────────────────────────────────

/// Encode a message as a single line, without the trailing newline.
pub fn encode(msg: &ProtocolMessage) -> String {
    let tag = msg.tag().as_str();
    match msg {
        ProtocolMessage::Hello {
            id,
            username,
            listen_port,
        } => {
            let port = listen_port.to_string();
            join_fields(&[tag, id.as_str(), username, &port])
        }
        ProtocolMessage::Msg { id, from, text } => join_fields(&[tag, id.as_str(), from, text]),
        ProtocolMessage::PeersReq { id } => join_fields(&[tag, id.as_str()]),
        ProtocolMessage::PeersRes { id, peers } => join_fields(&[tag, id.as_str(), peers]),
        ProtocolMessage::Bye { id, username } => join_fields(&[tag, id.as_str(), username]),
    }
}

/// Decode one line into a message.
///
/// `HELLO` must carry exactly its four fields. The other types need at
/// least their field count; trailing extra fields are ignored.
pub fn decode(line: &str) -> Result<ProtocolMessage, WireError> {
    if line.trim().is_empty() {
        return Err(WireError::Empty);
    }

    let raw = split_fields(line);
    let tag_str = raw[0].trim();
    let tag = MessageTag::parse(tag_str).ok_or_else(|| WireError::UnknownTag(tag_str.to_string()))?;

    let expected = tag.field_count();
    let too_few = raw.len() < expected;
    let too_many = tag == MessageTag::Hello && raw.len() > expected;
    if too_few || too_many {
        return Err(WireError::MissingFields {
            tag: tag.to_string(),
            expected,
            found: raw.len(),
        });
    }

    let field = |i: usize| unescape_field(raw[i]);
    let id = MessageId::from(field(1));

    let msg = match tag {
        MessageTag::Hello => ProtocolMessage::Hello {
            id,
            username: field(2),
            listen_port: parse_port(raw[3])?,
        },
        MessageTag::Msg => ProtocolMessage::Msg {
            id,
            from: field(2),
            text: field(3),
        },
        MessageTag::PeersReq => ProtocolMessage::PeersReq { id },
        MessageTag::PeersRes => ProtocolMessage::PeersRes {
            id,
            peers: field(2),
        },
        MessageTag::Bye => ProtocolMessage::Bye {
            id,
            username: field(2),
        },
    };
    Ok(msg)
}

// ── Discovery datagrams ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    /// "Who is out there?", multicast to the group.
    Discover,
    /// "I am here.", unicast reply to a `Discover` sender.
    Here,
}

impl DatagramKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DatagramKind::Discover => "DISCOVER",
            DatagramKind::Here => "HERE",
        }
    }
}

/// A discovery announcement or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryDatagram {
    pub kind: DatagramKind,
    /// TCP port the sender accepts peers on.
    pub listen_port: u16,
    pub username: String,
}

impl DiscoveryDatagram {
    pub fn discover(listen_port: u16, username: impl Into<String>) -> Self {
        Self {
            kind: DatagramKind::Discover,
            listen_port,
            username: username.into(),
        }
    }

    pub fn here(listen_port: u16, username: impl Into<String>) -> Self {
        Self {
            kind: DatagramKind::Here,
            listen_port,
            username: username.into(),
        }
    }

    pub fn encode(&self) -> String {
        let port = self.listen_port.to_string();
        join_fields(&[self.kind.as_str(), &port, &self.username])
    }

    /// Parse a datagram payload. Anything with fewer than three fields, an
    /// unknown type or a non-numeric port is rejected.
    pub fn decode(payload: &str) -> Result<Self, WireError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(WireError::Empty);
        }
        let raw = split_fields(payload);
        if raw.len() < 3 {
            return Err(WireError::MissingFields {
                tag: raw[0].to_string(),
                expected: 3,
                found: raw.len(),
            });
        }
        let kind = match raw[0] {
            "DISCOVER" => DatagramKind::Discover,
            "HERE" => DatagramKind::Here,
            other => return Err(WireError::UnknownTag(other.to_string())),
        };
        Ok(Self {
            kind,
            listen_port: parse_port(raw[1])?,
            username: unescape_field(raw[2]),
        })
    }
}
