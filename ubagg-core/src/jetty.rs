//! Bonding jetty context: one logical jetty over several member jettys.
//!
//! The context owns every piece of reliability state for the bonding jetty:
//! the virtual-connection table, the send and receive work-request buffers,
//! the header scratch arenas and the member validity flags. The transport
//! layer drives it:
//!
//! 1. [`JettyContext::post_send`] buffers a copy of the request, stamps it
//!    with a header and picks the member and target device to post it on.
//! 2. [`JettyContext::complete_send`] acknowledges the sequence number and
//!    releases strongly-ordered sends that were waiting on it.
//! 3. [`JettyContext::post_recv`] / [`JettyContext::complete_recv`] do the
//!    same on the receive side, dropping duplicates and holding
//!    strongly-ordered completions until every earlier msn has arrived.
//!
//! Lock order is connection, then buffer, then header arena. Scans over a
//! buffer never lock a connection.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::connection::{
    CompletionRecord, ConnectionTable, ConnHandle, CrStatus, JettyId, SoRecvCompletion, SoSend,
    TargetJetty, VirtualConnection,
};
use crate::control::BondConfig;
use crate::error::{BondError, Result};
use crate::hash_table::Visit;
use crate::id_alloc::IdBitmap;
use crate::proto::{BondHeader, ProtocolError};
use crate::scheduler::{BondingMode, PathChoice, PathCursor, Scheduler};
use crate::slide_window::WindowError;
use crate::topo::{Eid, TopologyMap};
use crate::wr::{DeepCopy, JfrWr, JfsWr, SegmentHandle, Sge, WrChain, WrFlags};
use crate::wr_buffer::{RecvWrBuffer, SendWrBuffer, WrExtra};

/// Maximum member devices behind one bonding device.
pub const MAX_DEV_NUM: usize = 8;

const ID_ALLOC_ATTEMPTS: u32 = 1024;

bitflags! {
    /// Error handling steps completed on a failed member jetty.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorDone: u8 {
        const SUSPEND_DONE = 1;
        const FLUSH_ERROR_DONE = 2;
    }
}

struct Member {
    valid: AtomicBool,
    error_done: AtomicU8,
}

impl Member {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(true),
            error_done: AtomicU8::new(0),
        }
    }
}

/// Fixed pool of header-sized slots the transport sends from or receives
/// into.
struct HeaderArena {
    buf: Vec<u8>,
    slots: IdBitmap,
    segment: Option<SegmentHandle>,
    what: &'static str,
}

impl HeaderArena {
    fn new(what: &'static str, slots: u32) -> Result<Self> {
        let len = slots as usize * BondHeader::SIZE;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| BondError::Alloc("header arena"))?;
        buf.resize(len, 0);
        Ok(Self {
            buf,
            slots: IdBitmap::new(slots)?,
            segment: None,
            what,
        })
    }

    fn range(slot: u32) -> Range<usize> {
        let start = slot as usize * BondHeader::SIZE;
        start..start + BondHeader::SIZE
    }

    fn alloc(&mut self) -> Result<u32> {
        self.slots.alloc()
    }

    fn release(&mut self, slot: u32) {
        if let Err(e) = self.slots.free(slot) {
            warn!(arena = self.what, slot, %e, "header slot release failed");
        }
    }

    fn sge(&self, slot: u32) -> Sge {
        Sge {
            addr: self.buf.as_ptr() as u64 + Self::range(slot).start as u64,
            len: BondHeader::SIZE as u32,
            segment: self.segment,
        }
    }

    fn write(&mut self, slot: u32, header: &BondHeader) {
        self.buf[Self::range(slot)].copy_from_slice(&header.encode());
    }

    fn fill(&mut self, slot: u32, bytes: &[u8]) -> Result<()> {
        if bytes.len() < BondHeader::SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: BondHeader::SIZE,
                actual: bytes.len(),
            }
            .into());
        }
        self.buf[Self::range(slot)].copy_from_slice(&bytes[..BondHeader::SIZE]);
        Ok(())
    }

    fn read(&self, slot: u32) -> Result<BondHeader> {
        Ok(BondHeader::decode(&self.buf[Self::range(slot)])?)
    }

    fn in_use(&self) -> u32 {
        self.slots.used()
    }
}

/// Where and how to post one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTicket {
    pub wr_id: u32,
    pub msn: u32,
    /// Member device to post on.
    pub member_idx: usize,
    /// Target device to address.
    pub target_idx: usize,
    /// Header carried in the first payload entry, for send opcodes.
    pub header: Option<BondHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDisposition {
    /// Post now.
    Ready(SendTicket),
    /// Strongly-ordered send waiting for earlier msns; released by
    /// [`JettyContext::complete_send`].
    Queued { wr_id: u32, msn: u32 },
}

impl SendDisposition {
    pub fn wr_id(&self) -> u32 {
        match self {
            Self::Ready(t) => t.wr_id,
            Self::Queued { wr_id, .. } => *wr_id,
        }
    }

    pub fn msn(&self) -> u32 {
        match self {
            Self::Ready(t) => t.msn,
            Self::Queued { msn, .. } => *msn,
        }
    }
}

/// A request in a posted list was refused. Everything before it was posted.
#[derive(Debug, thiserror::Error)]
#[error("work request {index} rejected")]
pub struct BadWr {
    pub index: usize,
    #[source]
    pub error: BondError,
    pub posted: Vec<SendDisposition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCompletion {
    pub cr: CompletionRecord,
    pub msn: u32,
    /// Strongly-ordered sends that may be posted now.
    pub released: Vec<SendTicket>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvTicket {
    pub wr_id: u32,
    pub member_idx: usize,
    /// Slot the header of the incoming payload lands in.
    pub header: Sge,
}

/// Receive completion as reported by a member jetty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvEvent {
    pub wr_id: u32,
    pub src: JettyId,
    /// Bytes received, header included.
    pub byte_len: u32,
    pub imm_data: u64,
    pub status: CrStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    OutOfWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Hand these to the caller, in order.
    Deliver(Vec<CompletionRecord>),
    /// Strongly-ordered payload waiting for an earlier msn.
    Held,
    /// Payload was already delivered or is not acceptable. The receive entry
    /// is consumed and should be reposted.
    Dropped { reason: DropReason, user_ctx: u64 },
}

/// Result of moving sends off a failed member.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reroute {
    pub tickets: Vec<SendTicket>,
    /// False when the scan stopped at a send with no alternate path.
    pub complete: bool,
}

struct ScanPaths {
    target_valid: Vec<bool>,
    rqe: PathCursor,
    non_rqe: PathCursor,
    direct: Vec<PathChoice>,
}

fn alloc_id(counter: &AtomicU32, taken: impl Fn(u32) -> bool) -> Result<u32> {
    for _ in 0..ID_ALLOC_ATTEMPTS {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        if !taken(id) {
            return Ok(id);
        }
    }
    Err(BondError::Alloc("work request id"))
}

fn ticket_for(wr_id: u32, extra: &WrExtra, choice: PathChoice) -> SendTicket {
    SendTicket {
        wr_id,
        msn: extra.msn,
        member_idx: choice.local,
        target_idx: choice.target,
        header: extra
            .hdr_slot
            .map(|_| BondHeader::new(extra.msn, extra.flags.contains(WrFlags::STRONG_ORDER))),
    }
}

fn flushed_cr(wr_id: u32, extra: &WrExtra) -> CompletionRecord {
    CompletionRecord {
        status: CrStatus::Flushed,
        user_ctx: extra.user_ctx,
        completion_len: 0,
        local_id: wr_id,
        remote_id: extra.target.unwrap_or_default(),
        imm_data: 0,
    }
}

pub struct JettyContext {
    members: Vec<Member>,
    scheduler: Scheduler,
    send_buf: SendWrBuffer,
    recv_buf: RecvWrBuffer,
    conns: ConnectionTable,
    hdr_send: Mutex<HeaderArena>,
    hdr_recv: Mutex<HeaderArena>,
    send_wr_id: AtomicU32,
    recv_wr_id: AtomicU32,
    post_recv_idx: AtomicUsize,
    topology: RwLock<Option<Arc<TopologyMap>>>,
}

impl JettyContext {
    pub fn new(member_count: usize, config: &BondConfig) -> Result<Self> {
        config.validate()?;
        if member_count == 0 || member_count > config.max_members {
            error!(member_count, max = config.max_members, "invalid member count");
            return Err(BondError::invalid(format!(
                "member count must be in 1..={}, got {member_count}",
                config.max_members
            )));
        }
        let ctx = Self {
            members: (0..member_count).map(|_| Member::new()).collect(),
            scheduler: Scheduler::new(config.mode),
            send_buf: SendWrBuffer::new("send wr", config.wr_buf_size),
            recv_buf: RecvWrBuffer::new("recv wr", config.wr_buf_size),
            conns: ConnectionTable::new(config.conn_table_size, config.conn_limits()),
            hdr_send: Mutex::new(HeaderArena::new("send header arena", config.hdr_slots)?),
            hdr_recv: Mutex::new(HeaderArena::new("recv header arena", config.hdr_slots)?),
            send_wr_id: AtomicU32::new(0),
            recv_wr_id: AtomicU32::new(0),
            post_recv_idx: AtomicUsize::new(0),
            topology: RwLock::new(None),
        };
        debug!(members = member_count, mode = ?config.mode, "created bonding jetty context");
        Ok(ctx)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    fn member(&self, idx: usize) -> Result<&Member> {
        self.members
            .get(idx)
            .ok_or_else(|| BondError::invalid(format!("member {idx} out of range")))
    }

    /// Mark a member usable or not. Bringing a member back clears its
    /// error-done flags.
    pub fn set_member_valid(&self, idx: usize, valid: bool) -> Result<()> {
        let member = self.member(idx)?;
        member.valid.store(valid, Ordering::Release);
        if valid {
            member.error_done.store(0, Ordering::Release);
        }
        debug!(member = idx, valid, "member validity changed");
        Ok(())
    }

    pub fn member_valid(&self, idx: usize) -> bool {
        self.members
            .get(idx)
            .is_some_and(|m| m.valid.load(Ordering::Acquire))
    }

    pub fn members_valid(&self) -> Vec<bool> {
        self.members
            .iter()
            .map(|m| m.valid.load(Ordering::Acquire))
            .collect()
    }

    /// Record that an error handling step finished on a member. Returns the
    /// accumulated flags.
    pub fn mark_error_done(&self, idx: usize, step: ErrorDone) -> Result<ErrorDone> {
        let prev = self
            .member(idx)?
            .error_done
            .fetch_or(step.bits(), Ordering::AcqRel);
        Ok(ErrorDone::from_bits_truncate(prev | step.bits()))
    }

    pub fn error_done(&self, idx: usize) -> ErrorDone {
        self.members.get(idx).map_or(ErrorDone::empty(), |m| {
            ErrorDone::from_bits_truncate(m.error_done.load(Ordering::Acquire))
        })
    }

    /// Every invalid member has completed `steps`.
    pub fn error_handling_done(&self, steps: ErrorDone) -> bool {
        self.members
            .iter()
            .filter(|m| !m.valid.load(Ordering::Acquire))
            .all(|m| ErrorDone::from_bits_truncate(m.error_done.load(Ordering::Acquire)).contains(steps))
    }

    /// Replace the topology used for direct-route preference. There is no
    /// incremental update.
    pub fn set_topology(&self, map: Option<TopologyMap>) {
        let map = map.map(Arc::new);
        debug!(installed = map.is_some(), "topology replaced");
        *self.topology.write() = map;
    }

    pub fn topology(&self) -> Option<Arc<TopologyMap>> {
        self.topology.read().clone()
    }

    /// Attach registered segments to every header entry handed out from now
    /// on.
    pub fn register_header_segments(&self, send: SegmentHandle, recv: SegmentHandle) {
        self.hdr_send.lock().segment = Some(send);
        self.hdr_recv.lock().segment = Some(recv);
    }

    pub fn connection(&self, remote: &JettyId) -> Option<ConnHandle> {
        self.conns.lookup(remote)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn send_outstanding(&self) -> usize {
        self.send_buf.count()
    }

    pub fn recv_outstanding(&self) -> usize {
        self.recv_buf.count()
    }

    pub fn send_header_slots_in_use(&self) -> u32 {
        self.hdr_send.lock().in_use()
    }

    pub fn recv_header_slots_in_use(&self) -> u32 {
        self.hdr_recv.lock().in_use()
    }

    /// Look at a buffered send, e.g. to post its copy on the chosen member.
    pub fn with_send_wr<R>(&self, wr_id: u32, f: impl FnOnce(&JfsWr, &WrExtra) -> R) -> Option<R> {
        self.send_buf.with_entry(wr_id, |e| f(&e.wr, &e.extra))
    }

    pub fn with_recv_wr<R>(&self, wr_id: u32, f: impl FnOnce(&JfrWr, &WrExtra) -> R) -> Option<R> {
        self.recv_buf.with_entry(wr_id, |e| f(&e.wr, &e.extra))
    }

    /// Update one target device flag of an established connection.
    pub fn set_target_valid(&self, remote: &JettyId, idx: usize, valid: bool) -> Result<()> {
        let conn = self
            .conns
            .lookup(remote)
            .ok_or_else(|| BondError::not_found("virtual connection", remote))?;
        let mut conn = conn.lock();
        conn.set_target_valid(idx, valid)
    }

    /// Direct-route pairs towards the bonding device owning `target`, as
    /// (member, target device) indices: plane `p` maps to device `p`.
    fn direct_pairs(&self, target: &Eid) -> Vec<PathChoice> {
        if self.scheduler.mode() != BondingMode::DirectPreferred {
            return Vec::new();
        }
        let guard = self.topology.read();
        let Some(entry) = guard.as_ref().and_then(|topo| {
            let bonding = topo.bonding_eid_for(target)?;
            topo.direct_routes(&bonding)
        }) else {
            return Vec::new();
        };
        let mut pairs = Vec::new();
        for route in entry.routes() {
            let choice = PathChoice {
                local: route.local.plane,
                target: route.remote.plane,
            };
            if choice.local < self.members.len() && !pairs.contains(&choice) {
                pairs.push(choice);
            }
        }
        pairs
    }

    fn pick_path(
        &self,
        conn: &mut VirtualConnection,
        consumes_rqe: bool,
        local_valid: &[bool],
        direct: &[PathChoice],
    ) -> Result<PathChoice> {
        let (cursor, targets) = conn.cursor_and_targets(consumes_rqe);
        self.scheduler
            .schedule(cursor, local_valid, targets, direct)
            .ok_or(BondError::NoValidPath)
    }

    /// Buffer one send and decide where it goes.
    ///
    /// Fails with [`BondError::Capacity`] when the send window is full; the
    /// sequence number is not consumed in that case.
    pub fn post_send(&self, target: &TargetJetty, wr: &JfsWr) -> Result<SendDisposition> {
        if wr.target.is_some_and(|id| id != target.id) {
            return Err(BondError::invalid(format!(
                "work request addressed to a jetty other than {}",
                target.id
            )));
        }
        wr.check()?;
        let conn = self.conns.get_or_add_on_send(target)?;
        let mut conn = conn.lock();
        if conn.target().is_none() {
            // Connection was created by a receive.
            conn.init_on_send(target.clone());
        }

        let msn = conn.peek_msn();
        if !conn.send_window().seq_in_window(msn) {
            return Err(BondError::Capacity {
                what: "send window",
                capacity: conn.send_window().window_size() as usize,
            });
        }

        let strongly_ordered = wr.is_strongly_ordered();
        let defer = strongly_ordered && (!conn.so_send_ready(msn) || conn.send_so_len() > 0);
        let path = if defer {
            None
        } else {
            let local_valid = self.members_valid();
            let direct = self.direct_pairs(&target.id.eid);
            Some(self.pick_path(&mut conn, wr.opcode.consumes_rqe(), &local_valid, &direct)?)
        };

        let wr_id = alloc_id(&self.send_wr_id, |id| self.send_buf.contains(id))?;
        let header = BondHeader::new(msn, strongly_ordered);
        let hdr = if wr.opcode.is_send() {
            let mut arena = self.hdr_send.lock();
            let slot = arena.alloc()?;
            arena.write(slot, &header);
            Some((slot, arena.sge(slot)))
        } else {
            None
        };
        let hdr_slot = hdr.as_ref().map(|(slot, _)| *slot);
        let release_slot = || {
            if let Some(slot) = hdr_slot {
                self.hdr_send.lock().release(slot);
            }
        };

        let copy = match wr.deep_copy(hdr.as_ref().map(|(_, sge)| sge)) {
            Ok(copy) => copy,
            Err(e) => {
                release_slot();
                return Err(e);
            }
        };
        let extra = WrExtra {
            user_ctx: wr.user_ctx,
            flags: wr.flags,
            msn,
            target: Some(target.id),
            send_idx: path.map_or(0, |p| p.local),
            target_idx: path.map_or(0, |p| p.target),
            trans_mode: target.trans_mode,
            hdr_slot,
        };
        let stored = match path {
            Some(_) => self.send_buf.add(wr_id, copy, extra),
            None => conn.push_send_so(SoSend {
                wr_id,
                wr: copy,
                extra,
            }),
        };
        if let Err(e) = stored {
            release_slot();
            return Err(e);
        }
        conn.next_msn();

        Ok(match path {
            Some(p) => SendDisposition::Ready(SendTicket {
                wr_id,
                msn,
                member_idx: p.local,
                target_idx: p.target,
                header: hdr_slot.map(|_| header),
            }),
            None => {
                debug!(wr_id, msn, remote = %target.id, "strongly-ordered send queued");
                SendDisposition::Queued { wr_id, msn }
            }
        })
    }

    /// Post a list of sends in order, stopping at the first refusal.
    pub fn post_send_list(
        &self,
        target: &TargetJetty,
        wrs: &[JfsWr],
    ) -> std::result::Result<Vec<SendDisposition>, BadWr> {
        let mut posted = Vec::with_capacity(wrs.len());
        for (index, wr) in wrs.iter().enumerate() {
            match self.post_send(target, wr) {
                Ok(d) => posted.push(d),
                Err(error) => {
                    return Err(BadWr {
                        index,
                        error,
                        posted,
                    })
                }
            }
        }
        Ok(posted)
    }

    /// Move every strongly-ordered send that is now in order into the send
    /// buffer. Caller holds the connection.
    fn release_so_sends(&self, conn: &mut VirtualConnection) -> Vec<SendTicket> {
        let mut released = Vec::new();
        let Some(remote) = conn.target().map(|t| t.id) else {
            return released;
        };
        while conn.send_so_front_ready() {
            let consumes_rqe = conn
                .front_send_so()
                .is_some_and(|so| so.wr.opcode.consumes_rqe());
            let local_valid = self.members_valid();
            let direct = self.direct_pairs(&remote.eid);
            let choice = match self.pick_path(conn, consumes_rqe, &local_valid, &direct) {
                Ok(choice) => choice,
                Err(e) => {
                    warn!(remote = %remote, %e, "strongly-ordered send stays queued");
                    break;
                }
            };
            let Some(mut so) = conn.pop_send_so() else {
                break;
            };
            so.extra.send_idx = choice.local;
            so.extra.target_idx = choice.target;
            let ticket = ticket_for(so.wr_id, &so.extra, choice);
            let hdr_slot = so.extra.hdr_slot;
            match self.send_buf.add(so.wr_id, so.wr, so.extra) {
                Ok(()) => released.push(ticket),
                Err(e) => {
                    error!(wr_id = ticket.wr_id, %e, "failed to buffer released send");
                    if let Some(slot) = hdr_slot {
                        self.hdr_send.lock().release(slot);
                    }
                }
            }
        }
        released
    }

    /// A member reported a send as done. Acknowledges its msn and releases
    /// any strongly-ordered send now in order.
    pub fn complete_send(&self, wr_id: u32, status: CrStatus) -> Result<SendCompletion> {
        let (wr, extra) = self
            .send_buf
            .move_out(wr_id)
            .ok_or_else(|| BondError::not_found("send wr", wr_id))?;
        if let Some(slot) = extra.hdr_slot {
            self.hdr_send.lock().release(slot);
        }
        let hdr_len = if extra.hdr_slot.is_some() {
            BondHeader::SIZE as u64
        } else {
            0
        };
        let cr = CompletionRecord {
            status,
            user_ctx: extra.user_ctx,
            completion_len: u32::try_from(wr.src_len().saturating_sub(hdr_len)).unwrap_or(u32::MAX),
            local_id: wr_id,
            remote_id: extra.target.unwrap_or_default(),
            imm_data: 0,
        };

        let mut released = Vec::new();
        if let Some(conn) = extra.target.and_then(|id| self.conns.lookup(&id)) {
            let mut conn = conn.lock();
            match conn.send_window_mut().add(extra.msn) {
                Ok(()) => {}
                Err(WindowError::Duplicate(msn)) => warn!(wr_id, msn, "duplicate acknowledgment"),
                Err(e) => warn!(wr_id, %e, "acknowledgment outside send window"),
            }
            released = self.release_so_sends(&mut conn);
        }
        Ok(SendCompletion {
            cr,
            msn: extra.msn,
            released,
        })
    }

    /// Pick a new path for a buffered send, keeping its msn and header.
    /// `failed_member` is excluded from the choice.
    pub fn retransmit(&self, wr_id: u32, failed_member: Option<usize>) -> Result<SendTicket> {
        let not_found = || BondError::not_found("send wr", wr_id);
        let (target, consumes_rqe) = self
            .send_buf
            .with_entry(wr_id, |e| (e.extra.target, e.wr.opcode.consumes_rqe()))
            .ok_or_else(not_found)?;
        let target = target.ok_or_else(|| BondError::invalid("buffered send has no target"))?;
        let conn = self
            .conns
            .lookup(&target)
            .ok_or_else(|| BondError::not_found("virtual connection", target))?;

        let mut local_valid = self.members_valid();
        if let Some(slot) = failed_member.and_then(|m| local_valid.get_mut(m)) {
            *slot = false;
        }
        let direct = self.direct_pairs(&target.eid);
        let mut conn = conn.lock();
        let choice = self.pick_path(&mut conn, consumes_rqe, &local_valid, &direct)?;
        let ticket = self
            .send_buf
            .with_entry(wr_id, |e| {
                e.extra.send_idx = choice.local;
                e.extra.target_idx = choice.target;
                ticket_for(wr_id, &e.extra, choice)
            })
            .ok_or_else(not_found)?;
        debug!(wr_id, msn = ticket.msn, member = choice.local, "retransmitting send");
        Ok(ticket)
    }

    /// Take a member out of service and move its outstanding sends to other
    /// paths. The scan stops at the first send with nowhere to go.
    pub fn fail_member(&self, member: usize) -> Result<Reroute> {
        self.set_member_valid(member, false)?;
        let local_valid = self.members_valid();

        let mut scan: HashMap<JettyId, ScanPaths> = HashMap::new();
        for (id, handle) in self.conns.handles() {
            let mut conn = handle.lock();
            if conn.target().is_none() {
                continue;
            }
            scan.insert(
                id,
                ScanPaths {
                    target_valid: conn.target_valid().to_vec(),
                    rqe: conn.cursor(true).clone(),
                    non_rqe: conn.cursor(false).clone(),
                    direct: self.direct_pairs(&id.eid),
                },
            );
        }

        let mut out = Reroute {
            tickets: Vec::new(),
            complete: true,
        };
        self.send_buf.traverse_and_remove(|e| {
            if e.extra.send_idx != member {
                return Visit::Keep;
            }
            let Some(remote) = e.extra.target else {
                return Visit::Keep;
            };
            let Some(paths) = scan.get_mut(&remote) else {
                return Visit::Keep;
            };
            let cursor = if e.wr.opcode.consumes_rqe() {
                &mut paths.rqe
            } else {
                &mut paths.non_rqe
            };
            match self
                .scheduler
                .schedule(cursor, &local_valid, &paths.target_valid, &paths.direct)
            {
                Some(choice) => {
                    e.extra.send_idx = choice.local;
                    e.extra.target_idx = choice.target;
                    out.tickets.push(ticket_for(e.id(), &e.extra, choice));
                    Visit::Keep
                }
                None => {
                    out.complete = false;
                    Visit::Stop
                }
            }
        });

        if out.complete {
            debug!(member, rerouted = out.tickets.len(), "member failed, sends rerouted");
        } else {
            warn!(member, rerouted = out.tickets.len(), "no alternate path, rerouting stopped");
        }
        Ok(out)
    }

    /// Cancel every outstanding send, or only those towards `remote`,
    /// including strongly-ordered sends still queued.
    pub fn flush_sends(&self, remote: Option<JettyId>) -> Vec<CompletionRecord> {
        let mut crs = Vec::new();
        let mut slots = Vec::new();
        self.send_buf.traverse_and_remove(|e| {
            if remote.is_some() && e.extra.target != remote {
                return Visit::Keep;
            }
            crs.push(flushed_cr(e.id(), &e.extra));
            slots.extend(e.extra.hdr_slot);
            Visit::Remove
        });
        for (id, handle) in self.conns.handles() {
            if remote.is_some_and(|r| r != id) {
                continue;
            }
            let mut conn = handle.lock();
            while let Some(so) = conn.pop_send_so() {
                crs.push(flushed_cr(so.wr_id, &so.extra));
                slots.extend(so.extra.hdr_slot);
            }
        }
        let mut arena = self.hdr_send.lock();
        for slot in slots {
            arena.release(slot);
        }
        debug!(count = crs.len(), "flushed sends");
        crs
    }

    fn next_recv_member(&self) -> Result<usize> {
        let n = self.members.len();
        let start = self.post_recv_idx.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|k| (start + k) % n)
            .find(|&i| self.members[i].valid.load(Ordering::Acquire))
            .ok_or(BondError::NoValidPath)
    }

    /// Buffer a list of receives on one member, each with a header slot in
    /// front of its payload entries. All or nothing.
    pub fn post_recv(&self, wrs: &[JfrWr]) -> Result<Vec<RecvTicket>> {
        let member_idx = self.next_recv_member()?;

        let mut slots = Vec::with_capacity(wrs.len());
        let sges: Vec<Sge> = {
            let mut arena = self.hdr_recv.lock();
            for _ in wrs {
                match arena.alloc() {
                    Ok(slot) => slots.push(slot),
                    Err(e) => {
                        slots.iter().for_each(|s| arena.release(*s));
                        return Err(e);
                    }
                }
            }
            slots.iter().map(|s| arena.sge(*s)).collect()
        };
        let release_all = |slots: &[u32]| {
            let mut arena = self.hdr_recv.lock();
            slots.iter().for_each(|s| arena.release(*s));
        };

        let chain = match WrChain::deep_copy(wrs, |i| sges.get(i).cloned()) {
            Ok(chain) => chain,
            Err(e) => {
                release_all(&slots);
                return Err(e);
            }
        };

        let mut tickets: Vec<RecvTicket> = Vec::with_capacity(chain.len());
        for (i, wr) in chain.into_iter().enumerate() {
            let added = alloc_id(&self.recv_wr_id, |id| self.recv_buf.contains(id)).and_then(|wr_id| {
                let mut extra = WrExtra::new(wr.user_ctx);
                extra.send_idx = member_idx;
                extra.hdr_slot = Some(slots[i]);
                self.recv_buf.add(wr_id, wr, extra).map(|()| wr_id)
            });
            match added {
                Ok(wr_id) => tickets.push(RecvTicket {
                    wr_id,
                    member_idx,
                    header: sges[i].clone(),
                }),
                Err(e) => {
                    for t in &tickets {
                        let _ = self.recv_buf.move_out(t.wr_id);
                    }
                    release_all(&slots);
                    return Err(e);
                }
            }
        }
        Ok(tickets)
    }

    /// Store the header bytes that arrived for a posted receive.
    pub fn write_recv_header(&self, wr_id: u32, bytes: &[u8]) -> Result<()> {
        let slot = self
            .recv_buf
            .with_entry(wr_id, |e| e.extra.hdr_slot)
            .flatten()
            .ok_or_else(|| BondError::not_found("recv wr", wr_id))?;
        self.hdr_recv.lock().fill(slot, bytes)
    }

    fn take_recv(&self, wr_id: u32) -> Result<(JfrWr, WrExtra)> {
        let (wr, extra) = self
            .recv_buf
            .move_out(wr_id)
            .ok_or_else(|| BondError::not_found("recv wr", wr_id))?;
        if let Some(slot) = extra.hdr_slot {
            self.hdr_recv.lock().release(slot);
        }
        Ok((wr, extra))
    }

    fn recv_cr(ev: &RecvEvent, extra: &WrExtra) -> CompletionRecord {
        let hdr_len = if extra.hdr_slot.is_some() {
            BondHeader::SIZE as u32
        } else {
            0
        };
        CompletionRecord {
            status: ev.status,
            user_ctx: extra.user_ctx,
            completion_len: ev.byte_len.saturating_sub(hdr_len),
            local_id: ev.wr_id,
            remote_id: ev.src,
            imm_data: ev.imm_data,
        }
    }

    /// A member reported a receive as done. Reads the header back, drops
    /// duplicates and releases strongly-ordered completions in msn order.
    ///
    /// A header that fails to decode leaves the receive buffered and returns
    /// the error. So does a strongly-ordered completion that would have to
    /// be held while the hold queue is full; the completion at the head is
    /// never held, so retrying after it arrives always makes progress.
    pub fn complete_recv(&self, ev: &RecvEvent) -> Result<RecvOutcome> {
        let slot = self
            .recv_buf
            .with_entry(ev.wr_id, |e| e.extra.hdr_slot)
            .ok_or_else(|| BondError::not_found("recv wr", ev.wr_id))?;
        if ev.status != CrStatus::Success {
            let (_, extra) = self.take_recv(ev.wr_id)?;
            return Ok(RecvOutcome::Deliver(vec![Self::recv_cr(ev, &extra)]));
        }
        let slot = slot.ok_or_else(|| BondError::invalid("receive posted without header slot"))?;
        let header = self.hdr_recv.lock().read(slot)?;

        let conn = self.conns.get_or_add_on_recv(ev.src)?;
        let mut conn = conn.lock();
        let at_head = header.msn == conn.recv_window().head();
        if header.strongly_ordered
            && !at_head
            && conn.recv_so_full()
            && conn.recv_window().seq_in_window(header.msn)
            && !conn.recv_window().has(header.msn)
        {
            return Err(BondError::Capacity {
                what: "strongly-ordered completion queue",
                capacity: conn.recv_so_capacity(),
            });
        }
        let (_, extra) = self.take_recv(ev.wr_id)?;

        match conn.recv_window_mut().add(header.msn) {
            Ok(()) => {}
            Err(WindowError::Duplicate(msn)) => {
                debug!(msn, src = %ev.src, "dropped duplicate delivery");
                return Ok(RecvOutcome::Dropped {
                    reason: DropReason::Duplicate,
                    user_ctx: extra.user_ctx,
                });
            }
            Err(e @ WindowError::OutOfWindow { .. }) => {
                let wnd = conn.recv_window();
                let behind = wnd.total_size() - wnd.distance_from_head(header.msn);
                // A copy the head passed moments ago is a redundant path
                // arriving late.
                if header.msn < wnd.total_size() && behind <= wnd.window_size() {
                    debug!(
                        msn = header.msn,
                        behind,
                        src = %ev.src,
                        "dropped late duplicate delivery"
                    );
                    return Ok(RecvOutcome::Dropped {
                        reason: DropReason::Duplicate,
                        user_ctx: extra.user_ctx,
                    });
                }
                warn!(src = %ev.src, %e, "dropped delivery outside receive window");
                return Ok(RecvOutcome::Dropped {
                    reason: DropReason::OutOfWindow,
                    user_ctx: extra.user_ctx,
                });
            }
        }

        let cr = Self::recv_cr(ev, &extra);
        if header.strongly_ordered && !at_head {
            conn.push_recv_so_cr(SoRecvCompletion {
                msn: header.msn,
                cr,
            })?;
            return Ok(RecvOutcome::Held);
        }
        let mut out = vec![cr];
        out.extend(conn.take_ready_recv_so().into_iter().map(|held| held.cr));
        Ok(RecvOutcome::Deliver(out))
    }
}

impl Drop for JettyContext {
    fn drop(&mut self) {
        let sends = self.send_buf.count();
        let recvs = self.recv_buf.count();
        let conns = self.conns.clear();
        debug!(sends, recvs, conns, "destroying bonding jetty context");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BondError;
    use crate::topo::tests::eid;
    use crate::topo::{PlaneInfo, PortInfo, TopoNode};
    use crate::wr::{Opcode, WrPayload};

    fn config() -> BondConfig {
        BondConfig {
            wr_buf_size: 32,
            hdr_slots: 16,
            conn_table_size: 8,
            window_size: 8,
            seq_space: 64,
            so_queue_capacity: 4,
            ..Default::default()
        }
    }

    fn remote() -> JettyId {
        JettyId::new(eid(2), 7, 0)
    }

    fn target() -> TargetJetty {
        TargetJetty::new(remote(), 2)
    }

    fn send_wr(user_ctx: u64) -> JfsWr {
        JfsWr::send(user_ctx, remote(), vec![Sge::new(0x1000, 64)])
    }

    fn so_wr(user_ctx: u64) -> JfsWr {
        send_wr(user_ctx).with_flags(WrFlags::STRONG_ORDER)
    }

    fn ready(d: SendDisposition) -> SendTicket {
        match d {
            SendDisposition::Ready(t) => t,
            other => panic!("expected a ready send, got {other:?}"),
        }
    }

    fn recv_wr(user_ctx: u64) -> JfrWr {
        JfrWr::new(user_ctx, vec![Sge::new(0x2000, 128)])
    }

    fn arrive(ctx: &JettyContext, wr_id: u32, msn: u32, so: bool) -> RecvOutcome {
        ctx.write_recv_header(wr_id, &BondHeader::new(msn, so).encode())
            .unwrap();
        ctx.complete_recv(&RecvEvent {
            wr_id,
            src: remote(),
            byte_len: 72,
            imm_data: 0,
            status: CrStatus::Success,
        })
        .unwrap()
    }

    fn user_ctxs(outcome: RecvOutcome) -> Vec<u64> {
        match outcome {
            RecvOutcome::Deliver(crs) => crs.iter().map(|cr| cr.user_ctx).collect(),
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_new_rejects_member_count() {
        assert!(JettyContext::new(0, &config()).is_err());
        assert!(JettyContext::new(MAX_DEV_NUM + 1, &config()).is_err());
        let ctx = JettyContext::new(2, &config()).unwrap();
        assert_eq!(ctx.member_count(), 2);
        assert_eq!(ctx.members_valid(), vec![true, true]);
    }

    #[test]
    fn test_post_and_complete_send() {
        let ctx = JettyContext::new(2, &config()).unwrap();
        let t = ready(ctx.post_send(&target(), &send_wr(42)).unwrap());
        assert_eq!(t.msn, 0);
        assert_eq!((t.member_idx, t.target_idx), (0, 0));
        assert_eq!(t.header, Some(BondHeader::new(0, false)));
        assert_eq!(ctx.send_outstanding(), 1);
        assert_eq!(ctx.send_header_slots_in_use(), 1);

        // The buffered copy carries the header in front of the payload.
        let lens = ctx
            .with_send_wr(t.wr_id, |wr, _| match &wr.payload {
                WrPayload::Send { src, .. } => src.iter().map(|s| s.len).collect::<Vec<_>>(),
                _ => Vec::new(),
            })
            .unwrap();
        assert_eq!(lens, vec![8, 64]);

        let done = ctx.complete_send(t.wr_id, CrStatus::Success).unwrap();
        assert_eq!(done.cr.user_ctx, 42);
        assert_eq!(done.cr.completion_len, 64);
        assert_eq!(done.cr.remote_id, remote());
        assert!(done.released.is_empty());
        assert_eq!(ctx.send_outstanding(), 0);
        assert_eq!(ctx.send_header_slots_in_use(), 0);
        let conn = ctx.connection(&remote()).unwrap();
        assert_eq!(conn.lock().send_window().head(), 1);

        assert!(matches!(
            ctx.complete_send(t.wr_id, CrStatus::Success),
            Err(BondError::NotFound { .. })
        ));
    }

    #[test]
    fn test_sends_stripe_across_paths() {
        let ctx = JettyContext::new(2, &config()).unwrap();
        let paths: Vec<_> = (0..5)
            .map(|i| {
                let t = ready(ctx.post_send(&target(), &send_wr(i)).unwrap());
                (t.member_idx, t.target_idx)
            })
            .collect();
        assert_eq!(paths, vec![(0, 0), (0, 1), (1, 0), (1, 1), (0, 0)]);
    }

    #[test]
    fn test_write_has_no_header() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        let wr = JfsWr::write(5, remote(), vec![Sge::new(0x1000, 16)], vec![Sge::new(0x9000, 16)]);
        let t = ready(ctx.post_send(&target(), &wr).unwrap());
        assert_eq!(t.header, None);
        assert_eq!(ctx.send_header_slots_in_use(), 0);
        let done = ctx.complete_send(t.wr_id, CrStatus::Success).unwrap();
        assert_eq!(done.cr.completion_len, 16);
    }

    #[test]
    fn test_send_window_full() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        let first = ready(ctx.post_send(&target(), &send_wr(0)).unwrap());
        for i in 1..8 {
            ctx.post_send(&target(), &send_wr(i)).unwrap();
        }
        assert!(matches!(
            ctx.post_send(&target(), &send_wr(8)),
            Err(BondError::Capacity { .. })
        ));
        // The refused send did not consume a sequence number.
        ctx.complete_send(first.wr_id, CrStatus::Success).unwrap();
        let t = ready(ctx.post_send(&target(), &send_wr(8)).unwrap());
        assert_eq!(t.msn, 8);
    }

    #[test]
    fn test_strongly_ordered_send_waits() {
        let ctx = JettyContext::new(2, &config()).unwrap();
        let a = ready(ctx.post_send(&target(), &send_wr(1)).unwrap());
        let q1 = ctx.post_send(&target(), &so_wr(2)).unwrap();
        let q2 = ctx.post_send(&target(), &so_wr(3)).unwrap();
        assert!(matches!(q1, SendDisposition::Queued { msn: 1, .. }));
        assert!(matches!(q2, SendDisposition::Queued { msn: 2, .. }));
        assert_eq!(ctx.send_outstanding(), 1);

        let done = ctx.complete_send(a.wr_id, CrStatus::Success).unwrap();
        assert_eq!(done.released.len(), 1);
        assert_eq!(done.released[0].wr_id, q1.wr_id());
        assert_eq!(done.released[0].header, Some(BondHeader::new(1, true)));

        let done = ctx.complete_send(q1.wr_id(), CrStatus::Success).unwrap();
        assert_eq!(done.released.len(), 1);
        assert_eq!(done.released[0].msn, 2);
        assert_eq!(ctx.send_outstanding(), 1);
    }

    #[test]
    fn test_strongly_ordered_first_send_goes_out() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        let t = ready(ctx.post_send(&target(), &so_wr(1)).unwrap());
        assert_eq!(t.header, Some(BondHeader::new(0, true)));
    }

    #[test]
    fn test_strongly_ordered_send_queue_full() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        let first = ready(ctx.post_send(&target(), &send_wr(0)).unwrap());
        for i in 1..=4 {
            assert!(matches!(
                ctx.post_send(&target(), &so_wr(i)).unwrap(),
                SendDisposition::Queued { .. }
            ));
        }
        assert!(matches!(
            ctx.post_send(&target(), &so_wr(5)),
            Err(BondError::Capacity { capacity: 4, .. })
        ));

        let done = ctx.complete_send(first.wr_id, CrStatus::Success).unwrap();
        assert_eq!(done.released.len(), 1);
        assert_eq!(done.released[0].msn, 1);
        // The refused send did not consume its msn.
        assert!(matches!(
            ctx.post_send(&target(), &so_wr(5)).unwrap(),
            SendDisposition::Queued { msn: 5, .. }
        ));
    }

    #[test]
    fn test_rejected_send_leaves_no_connection() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        let nop = JfsWr {
            opcode: Opcode::Nop,
            payload: WrPayload::None,
            ..send_wr(1)
        };
        assert!(matches!(
            ctx.post_send(&target(), &nop),
            Err(BondError::InvalidParameter(_))
        ));
        assert_eq!(ctx.connection_count(), 0);
        assert_eq!(ctx.send_header_slots_in_use(), 0);
    }

    #[test]
    fn test_post_send_list_stops_at_bad_wr() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        let nop = JfsWr {
            opcode: Opcode::Nop,
            payload: WrPayload::None,
            ..send_wr(2)
        };
        let err = ctx
            .post_send_list(&target(), &[send_wr(1), nop, send_wr(3)])
            .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.posted.len(), 1);
        assert!(matches!(err.error, BondError::InvalidParameter(_)));
        assert_eq!(ctx.send_outstanding(), 1);
        assert_eq!(ctx.send_header_slots_in_use(), 1);
    }

    #[test]
    fn test_post_send_rejects_other_target() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        let other = JettyId::new(eid(3), 1, 0);
        let wr = JfsWr::send(1, other, vec![Sge::new(0x1000, 8)]);
        assert!(matches!(
            ctx.post_send(&target(), &wr),
            Err(BondError::InvalidParameter(_))
        ));
        assert_eq!(ctx.connection_count(), 0);
    }

    #[test]
    fn test_receive_drops_redundant_copies() {
        let ctx = JettyContext::new(2, &config()).unwrap();
        let tickets = ctx
            .post_recv(&[
                recv_wr(10),
                recv_wr(11),
                recv_wr(12),
                recv_wr(13),
                recv_wr(14),
            ])
            .unwrap();
        assert_eq!(tickets.len(), 5);
        assert_eq!(tickets[0].header.len, 8);
        assert_eq!(ctx.recv_header_slots_in_use(), 5);

        // msn 2 arrives twice before msn 0: still in window, so a duplicate.
        assert_eq!(user_ctxs(arrive(&ctx, tickets[0].wr_id, 2, false)), vec![10]);
        assert_eq!(
            arrive(&ctx, tickets[1].wr_id, 2, false),
            RecvOutcome::Dropped {
                reason: DropReason::Duplicate,
                user_ctx: 11
            }
        );

        // msn 0 slides the head past itself; the late copy just behind the
        // head is still a duplicate.
        assert_eq!(user_ctxs(arrive(&ctx, tickets[2].wr_id, 0, false)), vec![12]);
        assert_eq!(
            arrive(&ctx, tickets[3].wr_id, 0, false),
            RecvOutcome::Dropped {
                reason: DropReason::Duplicate,
                user_ctx: 13
            }
        );

        // Far ahead of the window.
        assert_eq!(
            arrive(&ctx, tickets[4].wr_id, 40, false),
            RecvOutcome::Dropped {
                reason: DropReason::OutOfWindow,
                user_ctx: 14
            }
        );
        assert_eq!(ctx.recv_outstanding(), 0);
        assert_eq!(ctx.recv_header_slots_in_use(), 0);
    }

    #[test]
    fn test_strongly_ordered_receive_held() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        let t = ctx
            .post_recv(&[recv_wr(20), recv_wr(21), recv_wr(22)])
            .unwrap();

        assert_eq!(arrive(&ctx, t[0].wr_id, 2, true), RecvOutcome::Held);
        assert_eq!(arrive(&ctx, t[1].wr_id, 1, true), RecvOutcome::Held);
        // msn 0 releases everything held, in msn order.
        assert_eq!(user_ctxs(arrive(&ctx, t[2].wr_id, 0, false)), vec![22, 21, 20]);
        let conn = ctx.connection(&remote()).unwrap();
        assert_eq!(conn.lock().recv_so_len(), 0);
    }

    #[test]
    fn test_full_strongly_ordered_queue_admits_head() {
        let cfg = BondConfig {
            so_queue_capacity: 2,
            ..config()
        };
        let ctx = JettyContext::new(1, &cfg).unwrap();
        let t = ctx
            .post_recv(&[recv_wr(1), recv_wr(2), recv_wr(3), recv_wr(4), recv_wr(5)])
            .unwrap();
        assert_eq!(arrive(&ctx, t[0].wr_id, 1, true), RecvOutcome::Held);
        assert_eq!(arrive(&ctx, t[1].wr_id, 2, true), RecvOutcome::Held);

        // Queue full: msn 3 must wait and stays posted.
        ctx.write_recv_header(t[2].wr_id, &BondHeader::new(3, true).encode())
            .unwrap();
        let late = RecvEvent {
            wr_id: t[2].wr_id,
            src: remote(),
            byte_len: 72,
            imm_data: 0,
            status: CrStatus::Success,
        };
        assert!(matches!(
            ctx.complete_recv(&late),
            Err(BondError::Capacity { capacity: 2, .. })
        ));
        assert_eq!(ctx.recv_outstanding(), 3);

        // A redundant copy is still dropped while the queue is full.
        assert_eq!(
            arrive(&ctx, t[3].wr_id, 2, true),
            RecvOutcome::Dropped {
                reason: DropReason::Duplicate,
                user_ctx: 4
            }
        );

        // The head is delivered straight away and releases the held ones.
        assert_eq!(user_ctxs(arrive(&ctx, t[4].wr_id, 0, true)), vec![5, 1, 2]);
        assert_eq!(user_ctxs(ctx.complete_recv(&late).unwrap()), vec![3]);
        assert_eq!(ctx.recv_outstanding(), 0);
        assert_eq!(ctx.recv_header_slots_in_use(), 0);
    }

    #[test]
    fn test_receive_completion_len_and_errors() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        let t = ctx.post_recv(&[recv_wr(1), recv_wr(2)]).unwrap();

        let out = ctx
            .complete_recv(&RecvEvent {
                wr_id: t[0].wr_id,
                src: remote(),
                byte_len: 0,
                imm_data: 0,
                status: CrStatus::RemoteError,
            })
            .unwrap();
        match out {
            RecvOutcome::Deliver(crs) => {
                assert_eq!(crs.len(), 1);
                assert_eq!(crs[0].status, CrStatus::RemoteError);
                assert_eq!(crs[0].user_ctx, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Short or garbled headers leave the receive buffered.
        assert!(matches!(
            ctx.write_recv_header(t[1].wr_id, &[0u8; 4]),
            Err(BondError::Protocol(_))
        ));
        ctx.write_recv_header(t[1].wr_id, &[0, 0, 0, 0, 9, 0, 0, 0])
            .unwrap();
        let ev = RecvEvent {
            wr_id: t[1].wr_id,
            src: remote(),
            byte_len: 72,
            imm_data: 5,
            status: CrStatus::Success,
        };
        assert!(matches!(ctx.complete_recv(&ev), Err(BondError::Protocol(_))));
        assert_eq!(ctx.recv_outstanding(), 1);

        ctx.write_recv_header(t[1].wr_id, &BondHeader::new(0, false).encode())
            .unwrap();
        match ctx.complete_recv(&ev).unwrap() {
            RecvOutcome::Deliver(crs) => {
                assert_eq!(crs[0].completion_len, 64);
                assert_eq!(crs[0].imm_data, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_post_recv_rotates_members() {
        let ctx = JettyContext::new(2, &config()).unwrap();
        let a = ctx.post_recv(&[recv_wr(1)]).unwrap();
        let b = ctx.post_recv(&[recv_wr(2)]).unwrap();
        assert_ne!(a[0].member_idx, b[0].member_idx);

        ctx.set_member_valid(0, false).unwrap();
        ctx.set_member_valid(1, false).unwrap();
        assert!(matches!(
            ctx.post_recv(&[recv_wr(3)]),
            Err(BondError::NoValidPath)
        ));
        assert!(ctx.post_recv(&[]).is_err());
        assert_eq!(ctx.recv_header_slots_in_use(), 2);
    }

    #[test]
    fn test_fail_member_reroutes() {
        let ctx = JettyContext::new(2, &config()).unwrap();
        let ids: Vec<_> = (0..4)
            .map(|i| ready(ctx.post_send(&target(), &send_wr(i)).unwrap()).wr_id)
            .collect();

        let reroute = ctx.fail_member(0).unwrap();
        assert!(reroute.complete);
        assert_eq!(reroute.tickets.len(), 2);
        assert!(reroute.tickets.iter().all(|t| t.member_idx == 1));
        for id in &ids {
            assert_eq!(ctx.with_send_wr(*id, |_, extra| extra.send_idx), Some(1));
        }

        let reroute = ctx.fail_member(1).unwrap();
        assert!(!reroute.complete);
        assert!(reroute.tickets.is_empty());
        assert_eq!(ctx.send_outstanding(), 4);
    }

    #[test]
    fn test_retransmit_avoids_failed_member() {
        let ctx = JettyContext::new(2, &config()).unwrap();
        let t = ready(ctx.post_send(&target(), &send_wr(9)).unwrap());
        assert_eq!(t.member_idx, 0);

        let again = ctx.retransmit(t.wr_id, Some(0)).unwrap();
        assert_eq!(again.member_idx, 1);
        assert_eq!(again.msn, t.msn);
        assert_eq!(again.header, t.header);

        ctx.set_target_valid(&remote(), 0, false).unwrap();
        ctx.set_target_valid(&remote(), 1, false).unwrap();
        assert!(matches!(
            ctx.retransmit(t.wr_id, None),
            Err(BondError::NoValidPath)
        ));
        assert!(ctx.retransmit(1234, None).is_err());
    }

    #[test]
    fn test_flush_sends() {
        let ctx = JettyContext::new(1, &config()).unwrap();
        ready(ctx.post_send(&target(), &send_wr(1)).unwrap());
        ctx.post_send(&target(), &so_wr(2)).unwrap();

        let mut crs = ctx.flush_sends(Some(remote()));
        crs.sort_by_key(|cr| cr.user_ctx);
        assert_eq!(crs.len(), 2);
        assert!(crs.iter().all(|cr| cr.status == CrStatus::Flushed));
        assert_eq!(crs[0].user_ctx, 1);
        assert_eq!(crs[1].user_ctx, 2);
        assert_eq!(ctx.send_outstanding(), 0);
        assert_eq!(ctx.send_header_slots_in_use(), 0);
        let conn = ctx.connection(&remote()).unwrap();
        assert_eq!(conn.lock().send_so_len(), 0);
    }

    #[test]
    fn test_error_done_flags() {
        let ctx = JettyContext::new(2, &config()).unwrap();
        ctx.set_member_valid(0, false).unwrap();
        assert!(!ctx.error_handling_done(ErrorDone::SUSPEND_DONE));

        assert_eq!(
            ctx.mark_error_done(0, ErrorDone::SUSPEND_DONE).unwrap(),
            ErrorDone::SUSPEND_DONE
        );
        ctx.mark_error_done(0, ErrorDone::FLUSH_ERROR_DONE).unwrap();
        assert_eq!(ctx.error_done(0), ErrorDone::all());
        assert!(ctx.error_handling_done(ErrorDone::all()));

        ctx.set_member_valid(0, true).unwrap();
        assert_eq!(ctx.error_done(0), ErrorDone::empty());
        assert!(ctx.mark_error_done(5, ErrorDone::SUSPEND_DONE).is_err());
    }

    #[test]
    fn test_direct_preferred_uses_topology() {
        let ctx = JettyContext::new(
            2,
            &BondConfig {
                mode: BondingMode::DirectPreferred,
                ..config()
            },
        )
        .unwrap();
        let plane = |ports: Vec<PortInfo>| PlaneInfo {
            primary_eid: Eid::default(),
            ports,
            socket_id: 0,
        };
        let port = |own: u8, peer: u8| PortInfo {
            eid: eid(own),
            peer_eid: eid(peer),
        };
        ctx.set_topology(Some(
            TopologyMap::new(vec![
                TopoNode {
                    bonding_eid: eid(1),
                    planes: vec![plane(vec![]), plane(vec![port(11, 21)])],
                    is_current: true,
                },
                TopoNode {
                    bonding_eid: eid(2),
                    planes: vec![plane(vec![]), plane(vec![port(21, 11)])],
                    is_current: false,
                },
            ])
            .unwrap(),
        ));

        for i in 0..3 {
            let t = ready(ctx.post_send(&target(), &send_wr(i)).unwrap());
            assert_eq!((t.member_idx, t.target_idx), (1, 1));
        }

        // Without a topology the scheduler falls back to every pair.
        ctx.set_topology(None);
        let t = ready(ctx.post_send(&target(), &send_wr(9)).unwrap());
        assert_eq!((t.member_idx, t.target_idx), (0, 0));
    }
}
