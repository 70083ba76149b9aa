//! Bucketed hash table guarded by a read-write lock.
//!
//! This is the storage every keyed structure in the crate is built on: the
//! virtual-connection table, both work-request buffers and the direct-route
//! table of the topology map.
//!
//! A node type describes its own key, hash and comparison through
//! [`TableNode`]. Leaving [`TableNode::matches`] at its default turns
//! lookups into a hash-only fast path: the first node whose hash matches is
//! returned, which is what single-purpose tables keyed by a unique integer
//! want.
//!
//! Locking comes in two flavours. The methods on [`HashTable`] take the lock
//! for the duration of one call. Callers that need a larger atomic step, such
//! as "check the key is absent, then insert", take the guard themselves with
//! [`HashTable::write`] and call the same operations on [`Buckets`], which
//! never lock.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{BondError, Result};

/// Describes how a node stored in a [`HashTable`] is keyed.
pub trait TableNode {
    type Key: ?Sized;

    /// Key of this node.
    fn key(&self) -> &Self::Key;

    /// Hash of a key. Bucket selection is `hash % bucket_count`.
    fn hash_key(key: &Self::Key) -> u32;

    /// Compare this node against a lookup key.
    ///
    /// The default accepts any node whose hash matched.
    fn matches(&self, _key: &Self::Key) -> bool {
        true
    }
}

/// Outcome of a visitor passed to [`Buckets::traverse_and_remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Leave the node in the table and keep iterating.
    Keep,
    /// Remove and drop the node, then keep iterating.
    Remove,
    /// Stop iterating. This node and every node not yet visited stay.
    Stop,
}

struct Slot<N> {
    hash: u32,
    node: N,
}

/// Unlocked table body. Reached through [`HashTable::read`] and
/// [`HashTable::write`].
pub struct Buckets<N> {
    buckets: Vec<Vec<Slot<N>>>,
    len: usize,
    name: &'static str,
}

impl<N: TableNode> Buckets<N> {
    fn with_capacity(name: &'static str, capacity: usize) -> Self {
        let count = capacity.max(1).next_power_of_two();
        let mut buckets = Vec::with_capacity(count);
        buckets.resize_with(count, Vec::new);
        Self {
            buckets,
            len: 0,
            name,
        }
    }

    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize % self.buckets.len()
    }

    fn position(&self, key: &N::Key, hash: u32) -> Option<(usize, usize)> {
        let b = self.bucket_of(hash);
        self.buckets[b]
            .iter()
            .position(|slot| slot.hash == hash && slot.node.matches(key))
            .map(|i| (b, i))
    }

    /// First node in the key's bucket that matches.
    pub fn lookup(&self, key: &N::Key, hash: u32) -> Option<&N> {
        let (b, i) = self.position(key, hash)?;
        Some(&self.buckets[b][i].node)
    }

    pub fn lookup_mut(&mut self, key: &N::Key, hash: u32) -> Option<&mut N> {
        let (b, i) = self.position(key, hash)?;
        Some(&mut self.buckets[b][i].node)
    }

    pub fn contains(&self, key: &N::Key) -> bool {
        self.lookup(key, N::hash_key(key)).is_some()
    }

    /// Insert a node under an explicit hash.
    ///
    /// Fails with [`BondError::Collision`] if a matching node is already
    /// present; the existing node is left untouched.
    pub fn insert_with_hash(&mut self, node: N, hash: u32) -> Result<&mut N> {
        if self.lookup(node.key(), hash).is_some() {
            return Err(BondError::Collision(self.name));
        }
        let b = self.bucket_of(hash);
        let bucket = &mut self.buckets[b];
        bucket
            .try_reserve(1)
            .map_err(|_| BondError::Alloc("hash table node"))?;
        bucket.push(Slot { hash, node });
        self.len += 1;
        let last = bucket.len() - 1;
        Ok(&mut bucket[last].node)
    }

    pub fn insert(&mut self, node: N) -> Result<&mut N> {
        let hash = N::hash_key(node.key());
        self.insert_with_hash(node, hash)
    }

    /// Unlink a node and hand it back to the caller.
    pub fn remove(&mut self, key: &N::Key, hash: u32) -> Option<N> {
        let (b, i) = self.position(key, hash)?;
        self.len -= 1;
        Some(self.buckets[b].swap_remove(i).node)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &N> {
        self.buckets.iter().flatten().map(|slot| &slot.node)
    }

    /// Visit every node, removing those the visitor asks for.
    ///
    /// Returns how many nodes were removed.
    pub fn traverse_and_remove<F>(&mut self, mut visit: F) -> usize
    where
        F: FnMut(&mut N) -> Visit,
    {
        let mut removed = 0;
        for bucket in &mut self.buckets {
            let mut i = 0;
            while i < bucket.len() {
                match visit(&mut bucket[i].node) {
                    Visit::Keep => i += 1,
                    Visit::Remove => {
                        // Order within a bucket carries no meaning.
                        drop(bucket.swap_remove(i));
                        removed += 1;
                    }
                    Visit::Stop => {
                        self.len -= removed;
                        return removed;
                    }
                }
            }
        }
        self.len -= removed;
        removed
    }

    /// Remove every node, handing each to `release` exactly once.
    pub fn drain_with<F>(&mut self, mut release: F) -> usize
    where
        F: FnMut(N),
    {
        let mut count = 0;
        for bucket in &mut self.buckets {
            for slot in bucket.drain(..) {
                release(slot.node);
                count += 1;
            }
        }
        self.len = 0;
        count
    }
}

/// Hash table with its own read-write lock.
pub struct HashTable<N> {
    inner: RwLock<Buckets<N>>,
}

impl<N: TableNode> HashTable<N> {
    /// Create a table with roughly `capacity` buckets. `name` shows up in
    /// collision errors.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Buckets::with_capacity(name, capacity)),
        }
    }

    /// Shared guard for lock-free (already locked) lookups.
    pub fn read(&self) -> RwLockReadGuard<'_, Buckets<N>> {
        self.inner.read()
    }

    /// Exclusive guard for check-then-act sequences.
    pub fn write(&self) -> RwLockWriteGuard<'_, Buckets<N>> {
        self.inner.write()
    }

    pub fn insert(&self, node: N) -> Result<()> {
        self.inner.write().insert(node).map(|_| ())
    }

    pub fn insert_with_hash(&self, node: N, hash: u32) -> Result<()> {
        self.inner.write().insert_with_hash(node, hash).map(|_| ())
    }

    /// Run `f` on the matching node under the read lock.
    pub fn lookup_with<R>(&self, key: &N::Key, f: impl FnOnce(&N) -> R) -> Option<R> {
        let hash = N::hash_key(key);
        self.inner.read().lookup(key, hash).map(f)
    }

    /// Run `f` on the matching node under the write lock.
    pub fn lookup_mut_with<R>(&self, key: &N::Key, f: impl FnOnce(&mut N) -> R) -> Option<R> {
        let hash = N::hash_key(key);
        self.inner.write().lookup_mut(key, hash).map(f)
    }

    pub fn contains(&self, key: &N::Key) -> bool {
        self.inner.read().contains(key)
    }

    pub fn remove(&self, key: &N::Key) -> Option<N> {
        let hash = N::hash_key(key);
        self.inner.write().remove(key, hash)
    }

    pub fn traverse_and_remove<F>(&self, visit: F) -> usize
    where
        F: FnMut(&mut N) -> Visit,
    {
        self.inner.write().traverse_and_remove(visit)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Tear the table down, releasing every node exactly once.
    pub fn destroy(self) -> usize {
        self.inner.into_inner().drain_with(drop)
    }
}
