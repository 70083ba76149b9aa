//! Core library for the multi-path bonding reliability layer.
//!
//! A bonding device aggregates several member devices, each attached to a
//! different plane of the fabric. Requests posted on the bonding jetty are
//! striped over the members. Completions from the members are folded back
//! into one in-order, duplicate-free stream.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `hash_table`: Bucketed hash table with pluggable hashing, used by every store
//! - `queue`: Bounded FIFO for strongly-ordered payloads
//! - `slide_window`: Circular dedup window over the message sequence space
//! - `wr`, `wr_buffer`: Work-request descriptors and the in-flight store
//! - `topo`: Static fabric topology and direct-route discovery
//! - `scheduler`: Path selection across member and target devices
//! - `connection`: Per-peer virtual connections and their table
//! - `jetty`: The bonding jetty context that ties everything together
//! - `control`: Configuration
//!
//! # Example
//!
//! ```
//! use ubagg_core::{BondConfig, JettyContext, JettyId, JfsWr, SendDisposition, Sge, TargetJetty};
//!
//! # fn example() -> ubagg_core::Result<()> {
//! let ctx = JettyContext::new(2, &BondConfig::default())?;
//! let peer = JettyId::new("fe80::2".parse()?, 1, 0);
//! let target = TargetJetty::new(peer, 2);
//!
//! let wr = JfsWr::send(7, peer, vec![Sge::new(0x1000, 256)]);
//! if let SendDisposition::Ready(ticket) = ctx.post_send(&target, &wr)? {
//!     // Post the buffered copy on member `ticket.member_idx`, then:
//!     let done = ctx.complete_send(ticket.wr_id, Default::default())?;
//!     assert_eq!(done.cr.user_ctx, 7);
//! }
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod connection;
pub mod control;
pub mod error;
pub mod hash_table;
pub mod id_alloc;
pub mod jetty;
pub mod proto;
pub mod queue;
pub mod scheduler;
pub mod slide_window;
pub mod topo;
pub mod wr;
pub mod wr_buffer;

pub use connection::{CompletionRecord, CrStatus, JettyId, TargetJetty, TransportMode};
pub use control::{BondConfig, TopologyConfig};
pub use error::{BondError, Result};
pub use jetty::{JettyContext, RecvEvent, RecvOutcome, SendDisposition, SendTicket};
pub use proto::BondHeader;
pub use scheduler::BondingMode;
pub use topo::{Eid, TopologyMap};
pub use wr::{JfrWr, JfsWr, Opcode, Sge, WrFlags};
