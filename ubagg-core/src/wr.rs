//! Work-request descriptors and their deep copy.
//!
//! A posted chain is copied before it is buffered so the caller may reuse
//! its own descriptors as soon as the post returns. The copy owns every
//! scatter/gather list it references; registered-segment handles are the
//! one field that is never carried over.

use bitflags::bitflags;
use tracing::{error, warn};

use crate::connection::JettyId;
use crate::error::{BondError, Result};

/// Opaque handle of a registered memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle(pub u64);

/// Scatter/gather entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub segment: Option<SegmentHandle>,
}

impl Sge {
    pub fn new(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            segment: None,
        }
    }

    fn deep_copy(&self) -> Self {
        if self.segment.is_some() {
            warn!(addr = self.addr, "segment handle is not deep copied, clearing it");
        }
        Self {
            addr: self.addr,
            len: self.len,
            segment: None,
        }
    }
}

fn copy_sg(src: &[Sge], hdr: Option<&Sge>) -> Result<Vec<Sge>> {
    let mut out = Vec::new();
    out.try_reserve_exact(src.len() + usize::from(hdr.is_some()))
        .map_err(|_| BondError::Alloc("sge list"))?;
    if let Some(hdr) = hdr {
        out.push(hdr.clone());
    }
    out.extend(src.iter().map(Sge::deep_copy));
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Send,
    SendImm,
    SendInvalidate,
    Write,
    WriteImm,
    WriteNotify,
    Read,
    Cas,
    Faa,
    Nop,
}

impl Opcode {
    /// Two-sided send family. These carry the bonding header in their
    /// payload.
    pub fn is_send(self) -> bool {
        matches!(self, Self::Send | Self::SendImm | Self::SendInvalidate)
    }

    /// Consumes a receive entry on the target.
    pub fn consumes_rqe(self) -> bool {
        self.is_send() || self == Self::WriteImm
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WrFlags: u32 {
        /// Strong placement order with respect to earlier requests.
        const STRONG_ORDER = 1 << 0;
        const COMP_ORDER = 1 << 1;
        const FENCE = 1 << 2;
        const SOLICITED_ENABLE = 1 << 3;
        const COMPLETE_ENABLE = 1 << 4;
        const INLINE = 1 << 5;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrPayload {
    Send {
        src: Vec<Sge>,
        imm_data: u64,
    },
    Rw {
        src: Vec<Sge>,
        dst: Vec<Sge>,
        notify_data: u64,
    },
    Cas {
        dst: Sge,
        src: Sge,
        cmp_data: u64,
        swap_data: u64,
    },
    Faa {
        dst: Sge,
        src: Sge,
        operand: u64,
    },
    None,
}

/// Send-queue work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JfsWr {
    pub opcode: Opcode,
    pub flags: WrFlags,
    pub user_ctx: u64,
    pub target: Option<JettyId>,
    pub payload: WrPayload,
}

impl JfsWr {
    pub fn send(user_ctx: u64, target: JettyId, src: Vec<Sge>) -> Self {
        Self {
            opcode: Opcode::Send,
            flags: WrFlags::COMPLETE_ENABLE,
            user_ctx,
            target: Some(target),
            payload: WrPayload::Send { src, imm_data: 0 },
        }
    }

    pub fn write(user_ctx: u64, target: JettyId, src: Vec<Sge>, dst: Vec<Sge>) -> Self {
        Self {
            opcode: Opcode::Write,
            flags: WrFlags::COMPLETE_ENABLE,
            user_ctx,
            target: Some(target),
            payload: WrPayload::Rw {
                src,
                dst,
                notify_data: 0,
            },
        }
    }

    pub fn with_flags(mut self, flags: WrFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// The opcode can be posted with this payload.
    pub fn check(&self) -> Result<()> {
        let ok = match (self.opcode, &self.payload) {
            (op, WrPayload::Send { .. }) => op.is_send(),
            (
                Opcode::Write | Opcode::WriteImm | Opcode::WriteNotify | Opcode::Read,
                WrPayload::Rw { .. },
            )
            | (Opcode::Cas, WrPayload::Cas { .. })
            | (Opcode::Faa, WrPayload::Faa { .. }) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(BondError::invalid(format!(
                "opcode {:?} does not match its payload or cannot be posted",
                self.opcode
            )))
        }
    }

    pub fn is_strongly_ordered(&self) -> bool {
        self.flags.contains(WrFlags::STRONG_ORDER)
    }

    /// Total bytes described by the source list, header excluded.
    pub fn src_len(&self) -> u64 {
        match &self.payload {
            WrPayload::Send { src, .. } | WrPayload::Rw { src, .. } => {
                src.iter().map(|s| u64::from(s.len)).sum()
            }
            WrPayload::Cas { src, .. } | WrPayload::Faa { src, .. } => u64::from(src.len),
            WrPayload::None => 0,
        }
    }
}

/// Receive-queue work request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JfrWr {
    pub user_ctx: u64,
    pub src: Vec<Sge>,
}

impl JfrWr {
    pub fn new(user_ctx: u64, src: Vec<Sge>) -> Self {
        Self { user_ctx, src }
    }
}

/// Descriptor that can be copied into buffer-owned storage.
pub trait DeepCopy: Sized {
    /// Copy `self`, prepending `hdr` to the payload list where the
    /// descriptor carries a bonding header.
    fn deep_copy(&self, hdr: Option<&Sge>) -> Result<Self>;
}

impl DeepCopy for JfsWr {
    fn deep_copy(&self, hdr: Option<&Sge>) -> Result<Self> {
        let payload = match (self.opcode, &self.payload) {
            (op, WrPayload::Send { src, imm_data }) if op.is_send() => WrPayload::Send {
                src: copy_sg(src, hdr)?,
                imm_data: *imm_data,
            },
            (
                Opcode::Write | Opcode::WriteImm | Opcode::WriteNotify | Opcode::Read,
                WrPayload::Rw {
                    src,
                    dst,
                    notify_data,
                },
            ) => WrPayload::Rw {
                src: copy_sg(src, None)?,
                dst: copy_sg(dst, None)?,
                notify_data: *notify_data,
            },
            (
                Opcode::Cas,
                WrPayload::Cas {
                    dst,
                    src,
                    cmp_data,
                    swap_data,
                },
            ) => WrPayload::Cas {
                dst: dst.deep_copy(),
                src: src.deep_copy(),
                cmp_data: *cmp_data,
                swap_data: *swap_data,
            },
            (Opcode::Faa, WrPayload::Faa { dst, src, operand }) => WrPayload::Faa {
                dst: dst.deep_copy(),
                src: src.deep_copy(),
                operand: *operand,
            },
            (op, _) => {
                error!(opcode = ?op, "unsupported opcode for deep copy");
                return Err(BondError::invalid(format!(
                    "opcode {op:?} does not match its payload or cannot be copied"
                )));
            }
        };
        Ok(Self {
            opcode: self.opcode,
            flags: self.flags,
            user_ctx: self.user_ctx,
            target: self.target,
            payload,
        })
    }
}

impl DeepCopy for JfrWr {
    fn deep_copy(&self, hdr: Option<&Sge>) -> Result<Self> {
        Ok(Self {
            user_ctx: self.user_ctx,
            src: copy_sg(&self.src, hdr)?,
        })
    }
}

/// An owned chain of descriptors. The successor of entry `i` is `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrChain<T>(Vec<T>);

impl<T> WrChain<T> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }

    pub fn next_of(&self, idx: usize) -> Option<&T> {
        self.0.get(idx + 1)
    }

    pub fn into_vec(self) -> Vec<T> {
        self.0
    }
}

impl<T> IntoIterator for WrChain<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<T: DeepCopy> WrChain<T> {
    /// Copy every node of `src`. `hdr(i)` supplies the header entry for node
    /// `i`, if any. A failure at any node drops the nodes copied so far and
    /// reports the failing index.
    pub fn deep_copy(src: &[T], mut hdr: impl FnMut(usize) -> Option<Sge>) -> Result<Self> {
        if src.is_empty() {
            return Err(BondError::invalid("empty work request chain"));
        }
        let mut out = Vec::new();
        out.try_reserve_exact(src.len())
            .map_err(|_| BondError::Alloc("work request chain"))?;
        for (idx, wr) in src.iter().enumerate() {
            let hdr = hdr(idx);
            let copy = wr.deep_copy(hdr.as_ref()).map_err(|e| match e {
                BondError::InvalidParameter(msg) => {
                    BondError::InvalidParameter(format!("wr {idx}: {msg}"))
                }
                other => other,
            })?;
            out.push(copy);
        }
        Ok(Self(out))
    }
}
