//! Store for in-flight work requests, keyed by the id the bonding layer
//! generated when the request was posted.
//!
//! The buffer owns each deep-copied descriptor until it is moved out on
//! completion or removed on cancellation. The id doubles as its own hash, so
//! the table runs without a comparator.

use tracing::{debug, warn};

use crate::connection::{JettyId, TransportMode};
use crate::error::{BondError, Result};
use crate::hash_table::{HashTable, TableNode, Visit};
use crate::wr::{JfrWr, JfsWr, WrFlags};

/// Bookkeeping stored next to a buffered descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WrExtra {
    /// Context the caller attached to the original request.
    pub user_ctx: u64,
    /// Flags of the original request.
    pub flags: WrFlags,
    pub msn: u32,
    /// Remote jetty of the owning virtual connection.
    pub target: Option<JettyId>,
    /// Member device the request was posted on.
    pub send_idx: usize,
    /// Target device the request was addressed to.
    pub target_idx: usize,
    pub trans_mode: TransportMode,
    /// Header scratch slot, released with the entry.
    pub hdr_slot: Option<u32>,
}

impl WrExtra {
    pub fn new(user_ctx: u64) -> Self {
        Self {
            user_ctx,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct WrBufferEntry<W> {
    id: u32,
    pub wr: W,
    pub extra: WrExtra,
}

impl<W> WrBufferEntry<W> {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl<W> TableNode for WrBufferEntry<W> {
    type Key = u32;

    fn key(&self) -> &u32 {
        &self.id
    }

    fn hash_key(key: &u32) -> u32 {
        *key
    }
}

pub struct WrBuffer<W> {
    map: HashTable<WrBufferEntry<W>>,
    what: &'static str,
}

pub type SendWrBuffer = WrBuffer<JfsWr>;
pub type RecvWrBuffer = WrBuffer<JfrWr>;

impl<W> WrBuffer<W> {
    pub fn new(what: &'static str, size: usize) -> Self {
        Self {
            map: HashTable::new(what, size),
            what,
        }
    }

    /// Take ownership of `wr` under `id`.
    pub fn add(&self, id: u32, wr: W, extra: WrExtra) -> Result<()> {
        self.map.insert(WrBufferEntry { id, wr, extra })
    }

    pub fn contains(&self, id: u32) -> bool {
        self.map.contains(&id)
    }

    pub fn count(&self) -> usize {
        self.map.len()
    }

    /// Run `f` on the buffered entry in place. Ownership stays with the
    /// buffer.
    pub fn with_entry<R>(&self, id: u32, f: impl FnOnce(&mut WrBufferEntry<W>) -> R) -> Option<R> {
        self.map.lookup_mut_with(&id, f)
    }

    pub fn user_ctx(&self, id: u32) -> Result<u64> {
        self.map
            .lookup_with(&id, |e| e.extra.user_ctx)
            .ok_or_else(|| BondError::not_found(self.what, id))
    }

    /// Remove and drop the entry.
    pub fn remove(&self, id: u32) -> Result<()> {
        match self.map.remove(&id) {
            Some(_) => Ok(()),
            None => {
                warn!(buffer = self.what, id, "remove of unknown work request");
                Err(BondError::not_found(self.what, id))
            }
        }
    }

    /// Hand the descriptor and its bookkeeping back to the caller.
    pub fn move_out(&self, id: u32) -> Option<(W, WrExtra)> {
        self.map.remove(&id).map(|e| (e.wr, e.extra))
    }

    /// See [`Visit`] for what the visitor may ask for.
    pub fn traverse_and_remove(&self, visit: impl FnMut(&mut WrBufferEntry<W>) -> Visit) -> usize {
        self.map.traverse_and_remove(visit)
    }

    /// Remove every entry, handing each to `release`.
    pub fn drain_with(&self, mut release: impl FnMut(u32, W, WrExtra)) -> usize {
        let count = self
            .map
            .write()
            .drain_with(|e| release(e.id, e.wr, e.extra));
        if count > 0 {
            debug!(buffer = self.what, count, "drained work request buffer");
        }
        count
    }
}
