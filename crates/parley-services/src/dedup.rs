//! Bounded FIFO set of recently seen message ids.
//!
//! Used to stop forwarding loops: a node displays and relays a given
//! message id at most once while the id is still in the window.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use parley_core::MessageId;

struct SeenInner {
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
}

pub struct SeenCache {
    inner: Mutex<SeenInner>,
    capacity: usize,
}

impl SeenCache {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(SeenInner {
                order: VecDeque::with_capacity(capacity),
                members: HashSet::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Record `id` as seen.
    ///
    /// Returns `true` if the id was new. Check, insert and eviction of the
    /// oldest entries happen under one lock.
    pub fn insert(&self, id: &MessageId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.members.contains(id) {
            return false;
        }
        inner.order.push_back(id.clone());
        inner.members.insert(id.clone());
        while inner.order.len() > self.capacity {
            if let Some(old) = inner.order.pop_front() {
                tracing::trace!(id = %old, "evicted from dedup window");
                inner.members.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
