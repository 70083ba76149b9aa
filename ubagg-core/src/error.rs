//! Error taxonomy shared by every structure in the reliability layer.
//!
//! All failures are plain return values. Nothing in this crate panics or
//! aborts on a protocol anomaly; the caller decides whether to retry, drop
//! or escalate.

use crate::proto::ProtocolError;
use crate::slide_window::WindowError;

pub type Result<T> = std::result::Result<T, BondError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BondError {
    /// Memory or index exhaustion while creating a node, window or buffer.
    #[error("allocation failed: {0}")]
    Alloc(&'static str),

    /// Insert for a key that is already present. Re-lookup instead.
    #[error("key already present in {0}")]
    Collision(&'static str),

    #[error("{what} {key} not found")]
    NotFound { what: &'static str, key: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("sequence {seq} outside window [{head}, +{window_size})")]
    OutOfWindow { seq: u32, head: u32, window_size: u32 },

    #[error("duplicate sequence {0}")]
    Duplicate(u32),

    /// Bounded structure is full. Callers should back off and retry.
    #[error("capacity exhausted: {what} holds at most {capacity}")]
    Capacity { what: &'static str, capacity: usize },

    #[error("no valid path between local members and target devices")]
    NoValidPath,

    #[error("header error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl BondError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn not_found(what: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            what,
            key: key.to_string(),
        }
    }

    /// True for outcomes that are expected in steady state on a redundant
    /// path and must not be reported as failures.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

impl From<WindowError> for BondError {
    fn from(err: WindowError) -> Self {
        match err {
            WindowError::OutOfWindow {
                seq,
                head,
                window_size,
            } => Self::OutOfWindow {
                seq,
                head,
                window_size,
            },
            WindowError::Duplicate(seq) => Self::Duplicate(seq),
        }
    }
}
