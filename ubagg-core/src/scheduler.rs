//! Path selection across member devices.
//!
//! A path is a pair (local member device, target device). Both sides keep a
//! validity flag per device; only pairs valid on both sides are eligible.
//!
//! - **RoundRobin**: rotate over every eligible pair
//! - **DirectPreferred**: rotate over the eligible pairs that map onto a
//!   direct route in the topology, falling back to round-robin when none is
//!   usable
//!
//! The scheduler is pure and deterministic; the rotation state lives in a
//! [`PathCursor`] owned by each virtual connection.

use serde::{Deserialize, Serialize};

/// Bonding mode configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BondingMode {
    /// Round-robin striping across all valid pairs
    #[default]
    RoundRobin,
    /// Prefer pairs joined by a direct route
    DirectPreferred,
}

/// Scheduler decision result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathChoice {
    /// Local member device index
    pub local: usize,
    /// Target device index
    pub target: usize,
}

/// Rotation state for one class of traffic on one connection.
#[derive(Debug, Clone, Default)]
pub struct PathCursor {
    pair_idx: usize,
    direct_idx: usize,
}

impl PathCursor {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Next pair valid on both sides, in row-major order over
    /// `local × target`, starting after the previous pick.
    pub fn next_pair(&mut self, local_valid: &[bool], target_valid: &[bool]) -> Option<PathChoice> {
        let tn = target_valid.len();
        let total = local_valid.len() * tn;
        if total == 0 {
            return None;
        }
        for step in 0..total {
            let i = (self.pair_idx + step) % total;
            let (local, target) = (i / tn, i % tn);
            if local_valid[local] && target_valid[target] {
                self.pair_idx = (i + 1) % total;
                return Some(PathChoice { local, target });
            }
        }
        None
    }

    fn next_direct(
        &mut self,
        local_valid: &[bool],
        target_valid: &[bool],
        direct: &[PathChoice],
    ) -> Option<PathChoice> {
        let n = direct.len();
        for step in 0..n {
            let i = (self.direct_idx + step) % n;
            let choice = direct[i];
            let usable = local_valid.get(choice.local).copied().unwrap_or(false)
                && target_valid.get(choice.target).copied().unwrap_or(false);
            if usable {
                self.direct_idx = (i + 1) % n;
                return Some(choice);
            }
        }
        None
    }
}

/// Path scheduler
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    mode: BondingMode,
}

impl Scheduler {
    /// Create a new scheduler with the specified mode
    pub fn new(mode: BondingMode) -> Self {
        Self { mode }
    }

    /// Pick the path for one request.
    ///
    /// `direct` lists the pairs joined by a direct route; it is ignored in
    /// round-robin mode. Returns `None` when no pair is valid on both sides.
    pub fn schedule(
        &self,
        cursor: &mut PathCursor,
        local_valid: &[bool],
        target_valid: &[bool],
        direct: &[PathChoice],
    ) -> Option<PathChoice> {
        match self.mode {
            BondingMode::RoundRobin => cursor.next_pair(local_valid, target_valid),
            BondingMode::DirectPreferred => cursor
                .next_direct(local_valid, target_valid, direct)
                .or_else(|| cursor.next_pair(local_valid, target_valid)),
        }
    }

    /// Get the current bonding mode
    pub fn mode(&self) -> BondingMode {
        self.mode
    }

    /// Set the bonding mode
    pub fn set_mode(&mut self, mode: BondingMode) {
        self.mode = mode;
    }
}
