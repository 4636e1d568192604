use std::collections::{HashSet, VecDeque};

use message_bus::MsgId;

/// Ids an adapter has seen on its own bus and expects to bounce back.
///
/// Bounded: past `capacity` the oldest id is forgotten. An id that never
/// bounces would otherwise stay forever.
#[derive(Debug)]
pub struct TrackedIds {
    capacity: usize,
    ids: HashSet<MsgId>,
    order: VecDeque<MsgId>,
}

impl TrackedIds {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ids: HashSet::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &MsgId) -> bool {
        self.ids.contains(id)
    }

    /// Returns the id evicted to make room, if any.
    pub fn insert(&mut self, id: MsgId) -> Option<MsgId> {
        if !self.ids.insert(id) {
            return None;
        }
        self.order.push_back(id);
        if self.ids.len() <= self.capacity {
            return None;
        }
        let evicted = self.order.pop_front()?;
        self.ids.remove(&evicted);
        Some(evicted)
    }

    /// Removes `id`; true when it was tracked.
    pub fn take(&mut self, id: &MsgId) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        // bounces usually arrive for the newest ids
        if let Some(position) = self.order.iter().rposition(|tracked| tracked == id) {
            self.order.remove(position);
        }
        true
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}
