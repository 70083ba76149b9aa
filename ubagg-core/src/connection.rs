//! Virtual connections: per remote jetty reliability state.
//!
//! A virtual connection exists once per remote jetty a bonding jetty talks
//! to, created lazily by the first send or the first receive. It carries the
//! message sequence counter, a receive window for dedup, a send window for
//! acknowledgment tracking and the two strongly-ordered queues.
//!
//! The connection itself is not synchronized. The table hands out
//! [`ConnHandle`]s and every datapath step locks the connection it touches.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BondError, Result};
use crate::hash_table::{HashTable, TableNode};
use crate::queue::BoundedQueue;
use crate::scheduler::PathCursor;
use crate::slide_window::SlideWindow;
use crate::topo::Eid;
use crate::wr::JfsWr;
use crate::wr_buffer::WrExtra;

/// Receive and send window size.
pub const RECV_WND_SIZE: u32 = 1 << 12;
/// Size of the sequence space the windows slide over.
pub const MAX_BITMAP_SIZE: u32 = 1 << 24;
pub const MAX_SO_QUEUE_SIZE: usize = 65535;

/// Identity of a remote jetty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct JettyId {
    pub eid: Eid,
    pub id: u32,
    /// Owning process address space.
    pub uasid: u32,
}

impl JettyId {
    pub fn new(eid: Eid, id: u32, uasid: u32) -> Self {
        Self { eid, id, uasid }
    }
}

impl fmt::Display for JettyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.eid, self.id, self.uasid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Reliable message
    #[default]
    Rm,
    /// Reliable connection
    Rc,
    /// Unreliable message
    Um,
}

/// Imported remote bonding jetty, as the sender sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetJetty {
    pub id: JettyId,
    /// One flag per target device.
    pub target_valid: Vec<bool>,
    pub trans_mode: TransportMode,
}

impl TargetJetty {
    pub fn new(id: JettyId, dev_num: usize) -> Self {
        Self {
            id,
            target_valid: vec![true; dev_num],
            trans_mode: TransportMode::Rm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrStatus {
    #[default]
    Success,
    /// Cancelled by a flush.
    Flushed,
    LocalError,
    RemoteError,
}

/// Completion record handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompletionRecord {
    pub status: CrStatus,
    pub user_ctx: u64,
    /// Bytes transferred, bonding header excluded.
    pub completion_len: u32,
    /// Work request id the completion refers to.
    pub local_id: u32,
    pub remote_id: JettyId,
    pub imm_data: u64,
}

/// Window and queue sizing for new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnLimits {
    pub seq_space: u32,
    pub window_size: u32,
    pub so_queue_capacity: usize,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            seq_space: MAX_BITMAP_SIZE,
            window_size: RECV_WND_SIZE,
            so_queue_capacity: MAX_SO_QUEUE_SIZE,
        }
    }
}

/// Strongly-ordered send waiting for every earlier msn to be acknowledged.
#[derive(Debug)]
pub struct SoSend {
    pub wr_id: u32,
    pub wr: JfsWr,
    pub extra: WrExtra,
}

/// Strongly-ordered receive completion waiting for earlier msns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoRecvCompletion {
    pub msn: u32,
    pub cr: CompletionRecord,
}

#[derive(Debug)]
pub struct VirtualConnection {
    // Sender side only.
    target: Option<TargetJetty>,
    target_valid: Vec<bool>,
    rqe_cursor: PathCursor,
    non_rqe_cursor: PathCursor,

    msn: u32,
    seq_space: u32,
    recv_wnd: SlideWindow,
    send_wnd: SlideWindow,
    send_so_queue: BoundedQueue<SoSend>,
    recv_so_cr_queue: BoundedQueue<SoRecvCompletion>,
}

impl VirtualConnection {
    pub fn new(limits: ConnLimits) -> Result<Self> {
        Ok(Self {
            target: None,
            target_valid: Vec::new(),
            rqe_cursor: PathCursor::default(),
            non_rqe_cursor: PathCursor::default(),
            msn: 0,
            seq_space: limits.seq_space,
            recv_wnd: SlideWindow::new(limits.seq_space, limits.window_size, 0)?,
            send_wnd: SlideWindow::new(limits.seq_space, limits.window_size, 0)?,
            send_so_queue: BoundedQueue::new("strongly-ordered send queue", limits.so_queue_capacity),
            recv_so_cr_queue: BoundedQueue::new(
                "strongly-ordered completion queue",
                limits.so_queue_capacity,
            ),
        })
    }

    /// Seed the sender-side path state from the imported target.
    pub fn init_on_send(&mut self, target: TargetJetty) {
        self.target_valid = target.target_valid.clone();
        self.target = Some(target);
        self.rqe_cursor.reset();
        self.non_rqe_cursor.reset();
    }

    pub fn target(&self) -> Option<&TargetJetty> {
        self.target.as_ref()
    }

    pub fn target_valid(&self) -> &[bool] {
        &self.target_valid
    }

    pub fn set_target_valid(&mut self, idx: usize, valid: bool) -> Result<()> {
        let slot = self
            .target_valid
            .get_mut(idx)
            .ok_or_else(|| BondError::invalid(format!("target device {idx} out of range")))?;
        *slot = valid;
        Ok(())
    }

    /// Path cursor for requests that do or do not consume a remote receive
    /// entry.
    pub fn cursor(&mut self, consumes_rqe: bool) -> &mut PathCursor {
        if consumes_rqe {
            &mut self.rqe_cursor
        } else {
            &mut self.non_rqe_cursor
        }
    }

    /// Split borrow of the cursor and the target validity flags.
    pub fn cursor_and_targets(&mut self, consumes_rqe: bool) -> (&mut PathCursor, &[bool]) {
        let cursor = if consumes_rqe {
            &mut self.rqe_cursor
        } else {
            &mut self.non_rqe_cursor
        };
        (cursor, &self.target_valid)
    }

    /// Sequence number the next send will carry.
    pub fn peek_msn(&self) -> u32 {
        self.msn
    }

    /// Consume a sequence number.
    pub fn next_msn(&mut self) -> u32 {
        let msn = self.msn;
        self.msn = (self.msn + 1) % self.seq_space;
        msn
    }

    pub fn recv_window(&self) -> &SlideWindow {
        &self.recv_wnd
    }

    pub fn recv_window_mut(&mut self) -> &mut SlideWindow {
        &mut self.recv_wnd
    }

    pub fn send_window(&self) -> &SlideWindow {
        &self.send_wnd
    }

    pub fn send_window_mut(&mut self) -> &mut SlideWindow {
        &mut self.send_wnd
    }

    pub fn push_send_so(&mut self, data: SoSend) -> Result<()> {
        self.send_so_queue.push_tail(data)
    }

    pub fn pop_send_so(&mut self) -> Option<SoSend> {
        self.send_so_queue.pop_head()
    }

    pub fn front_send_so(&self) -> Option<&SoSend> {
        self.send_so_queue.front()
    }

    pub fn send_so_len(&self) -> usize {
        self.send_so_queue.len()
    }

    pub fn push_recv_so_cr(&mut self, data: SoRecvCompletion) -> Result<()> {
        self.recv_so_cr_queue.push_tail(data)
    }

    pub fn pop_recv_so_cr(&mut self) -> Option<SoRecvCompletion> {
        self.recv_so_cr_queue.pop_head()
    }

    pub fn recv_so_len(&self) -> usize {
        self.recv_so_cr_queue.len()
    }

    pub fn recv_so_full(&self) -> bool {
        self.recv_so_cr_queue.is_full()
    }

    pub fn recv_so_capacity(&self) -> usize {
        self.recv_so_cr_queue.capacity()
    }

    /// Strongly-ordered sends may go out when everything before them has
    /// been acknowledged.
    pub fn so_send_ready(&self, msn: u32) -> bool {
        self.send_wnd.head() == msn
    }

    /// The oldest queued strongly-ordered send may go out now.
    pub fn send_so_front_ready(&self) -> bool {
        self.send_so_queue
            .front()
            .is_some_and(|front| self.so_send_ready(front.extra.msn))
    }

    /// Remove every held completion the receive window has moved past, in
    /// msn order.
    pub fn take_ready_recv_so(&mut self) -> Vec<SoRecvCompletion> {
        let wnd = &self.recv_wnd;
        let mut ready = self
            .recv_so_cr_queue
            .extract_if(|held| !wnd.seq_in_window(held.msn));
        ready.sort_by_key(|held| wnd.distance_from_head(held.msn));
        ready
    }

    /// Drop every queued payload. Returns (sends, completions) released.
    pub fn drain_queues(&mut self) -> (usize, usize) {
        let sends = self.send_so_queue.drain_with(drop);
        let crs = self.recv_so_cr_queue.drain_with(drop);
        (sends, crs)
    }
}

impl Drop for VirtualConnection {
    fn drop(&mut self) {
        let (sends, crs) = self.drain_queues();
        if sends + crs > 0 {
            debug!(sends, completions = crs, "released queued strongly-ordered entries");
        }
    }
}

pub type ConnHandle = Arc<Mutex<VirtualConnection>>;

struct ConnNode {
    id: JettyId,
    conn: ConnHandle,
}

impl TableNode for ConnNode {
    type Key = JettyId;

    fn key(&self) -> &JettyId {
        &self.id
    }

    fn hash_key(key: &JettyId) -> u32 {
        key.eid
            .words()
            .iter()
            .fold(0u32, |acc, w| acc.wrapping_add(*w))
            .wrapping_add(key.id)
            .wrapping_add(key.uasid)
    }

    fn matches(&self, key: &JettyId) -> bool {
        self.id == *key
    }
}

/// Virtual connections keyed by remote jetty identity.
pub struct ConnectionTable {
    table: HashTable<ConnNode>,
    limits: ConnLimits,
}

impl ConnectionTable {
    pub fn new(size: usize, limits: ConnLimits) -> Self {
        Self {
            table: HashTable::new("virtual connection table", size),
            limits,
        }
    }

    pub fn lookup(&self, id: &JettyId) -> Option<ConnHandle> {
        self.table.lookup_with(id, |n| n.conn.clone())
    }

    fn add_with(&self, id: JettyId, init: impl FnOnce(&mut VirtualConnection)) -> Result<ConnHandle> {
        let mut guard = self.table.write();
        let hash = ConnNode::hash_key(&id);
        if guard.lookup(&id, hash).is_some() {
            return Err(BondError::Collision("virtual connection table"));
        }
        let mut conn = VirtualConnection::new(self.limits)?;
        init(&mut conn);
        let conn = Arc::new(Mutex::new(conn));
        guard.insert_with_hash(
            ConnNode {
                id,
                conn: conn.clone(),
            },
            hash,
        )?;
        debug!(remote = %id, "virtual connection established");
        Ok(conn)
    }

    /// Create the sender-side connection for `target`. Fails with
    /// [`BondError::Collision`] if one exists; re-lookup in that case.
    pub fn add_on_send(&self, target: &TargetJetty) -> Result<ConnHandle> {
        let target = target.clone();
        self.add_with(target.id, |conn| conn.init_on_send(target))
    }

    /// Create the receiver-side connection for `id`.
    pub fn add_on_recv(&self, id: JettyId) -> Result<ConnHandle> {
        self.add_with(id, |_| {})
    }

    pub fn get_or_add_on_send(&self, target: &TargetJetty) -> Result<ConnHandle> {
        if let Some(conn) = self.lookup(&target.id) {
            return Ok(conn);
        }
        match self.add_on_send(target) {
            Err(BondError::Collision(_)) => self
                .lookup(&target.id)
                .ok_or_else(|| BondError::not_found("virtual connection", target.id)),
            other => other,
        }
    }

    pub fn get_or_add_on_recv(&self, id: JettyId) -> Result<ConnHandle> {
        if let Some(conn) = self.lookup(&id) {
            return Ok(conn);
        }
        match self.add_on_recv(id) {
            Err(BondError::Collision(_)) => self
                .lookup(&id)
                .ok_or_else(|| BondError::not_found("virtual connection", id)),
            other => other,
        }
    }

    /// Handles of every connection, for scans that lock connections one by
    /// one.
    pub fn handles(&self) -> Vec<(JettyId, ConnHandle)> {
        self.table
            .read()
            .iter()
            .map(|n| (n.id, n.conn.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Remove every connection. Returns how many were torn down.
    pub fn clear(&self) -> usize {
        self.table.write().drain_with(drop)
    }
}
