//! In-memory session history.
//!
//! Append-only, timestamped log of chat traffic and system notices.
//! Cheap to clone; all clones share the same log.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};

pub const SYSTEM_SENDER: &str = "SYSTEM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    System,
}

#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub timestamp: DateTime<Local>,
    pub from: String,
    pub text: String,
    pub direction: Direction,
}

impl ChatEntry {
    /// One display line: `[HH:MM:SS] ...`.
    pub fn format(&self) -> String {
        let ts = self.timestamp.format("%H:%M:%S");
        match self.direction {
            Direction::System => format!("[{ts}] * {}", self.text),
            Direction::Outbound => format!("[{ts}] {} (you): {}", self.from, self.text),
            Direction::Inbound => format!("[{ts}] {}: {}", self.from, self.text),
        }
    }
}

impl fmt::Display for ChatEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

#[derive(Clone, Default)]
pub struct MessageHistory {
    entries: Arc<Mutex<Vec<ChatEntry>>>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, from: &str, text: &str, direction: Direction) -> ChatEntry {
        let entry = ChatEntry {
            timestamp: Local::now(),
            from: from.to_string(),
            text: text.to_string(),
            direction,
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        entry
    }

    pub fn record_inbound(&self, from: &str, text: &str) -> ChatEntry {
        self.push(from, text, Direction::Inbound)
    }

    pub fn record_outbound(&self, from: &str, text: &str) -> ChatEntry {
        self.push(from, text, Direction::Outbound)
    }

    pub fn record_system(&self, text: impl AsRef<str>) -> ChatEntry {
        self.push(SYSTEM_SENDER, text.as_ref(), Direction::System)
    }

    pub fn snapshot(&self) -> Vec<ChatEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every entry formatted, one per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for entry in self.snapshot() {
            out.push_str(&entry.format());
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in one direction, oldest first.
    pub fn entries_in(&self, direction: Direction) -> Vec<ChatEntry> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.direction == direction)
            .collect()
    }
}
