//! Fixed-capacity FIFO used to stage strongly-ordered sends and receive
//! completions.
//!
//! The queue owns its payloads; anything still queued when the queue is
//! dropped is released with it. Use [`BoundedQueue::drain_with`] when a
//! teardown needs to do more than drop.

use std::collections::VecDeque;

use crate::error::{BondError, Result};

#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    max_node: usize,
    what: &'static str,
}

impl<T> BoundedQueue<T> {
    /// `what` names the queue in capacity errors.
    pub fn new(what: &'static str, max_node: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_node,
            what,
        }
    }

    /// Append at the tail. Fails with [`BondError::Capacity`] when full.
    pub fn push_tail(&mut self, data: T) -> Result<()> {
        if self.items.len() >= self.max_node {
            return Err(BondError::Capacity {
                what: self.what,
                capacity: self.max_node,
            });
        }
        self.items
            .try_reserve(1)
            .map_err(|_| BondError::Alloc("queue node"))?;
        self.items.push_back(data);
        Ok(())
    }

    pub fn pop_head(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn pop_tail(&mut self) -> Option<T> {
        self.items.pop_back()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_node
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.max_node
    }

    /// Visit every payload head to tail without removing anything.
    pub fn for_each(&self, visit: impl FnMut(&T)) {
        self.items.iter().for_each(visit);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Empty the queue head to tail, handing each payload to `release`.
    pub fn drain_with(&mut self, mut release: impl FnMut(T)) -> usize {
        let count = self.items.len();
        while let Some(item) = self.items.pop_front() {
            release(item);
        }
        count
    }

    /// Remove the payloads for which `ready` holds, keeping the relative
    /// order of everything that stays.
    pub fn extract_if(&mut self, mut ready: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if ready(&item) {
                taken.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        taken
    }
}
