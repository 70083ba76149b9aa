//! Circular sliding window over a sequence-number space.
//!
//! The window covers `[head, head + window_size)` modulo `total_size`.
//! Marking the sequence at `head` slides the window forward over every
//! contiguous marked sequence in one call, clearing each bit that falls out
//! of range, so no bit outside the window is ever set.
//!
//! Receive side: detect and drop deliveries already seen on another path.
//! Send side: record acknowledgments and bound the number of unacknowledged
//! sequence numbers.
//!
//! Not internally locked; callers serialize access per connection.

use crate::error::{BondError, Result};

const WORD_BITS: u32 = u64::BITS;

/// Why [`SlideWindow::add`] refused a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    /// Not in the acceptance range: either a very late duplicate or a
    /// protocol violation. Discard.
    #[error("sequence {seq} outside window [{head}, +{window_size})")]
    OutOfWindow { seq: u32, head: u32, window_size: u32 },

    /// Already marked. The payload was delivered before and must be dropped.
    #[error("duplicate sequence {0}")]
    Duplicate(u32),
}

#[derive(Debug, Clone)]
pub struct SlideWindow {
    bits: Vec<u64>,
    total_size: u32,
    window_size: u32,
    head: u32,
}

fn in_loop_range(head: u32, len: u32, total: u32, seq: u32) -> bool {
    let tail = ((head as u64 + len as u64) % total as u64) as u32;
    if tail < head {
        seq >= head || seq < tail
    } else {
        seq >= head && seq < tail
    }
}

impl SlideWindow {
    /// Create a window of `window_size` over `total_size` sequence numbers
    /// starting at `head % total_size`.
    pub fn new(total_size: u32, window_size: u32, head: u32) -> Result<Self> {
        if window_size == 0 {
            return Err(BondError::invalid("window_size must be non-zero"));
        }
        if total_size <= window_size {
            return Err(BondError::invalid(format!(
                "total_size ({total_size}) must exceed window_size ({window_size})"
            )));
        }
        let words = total_size.div_ceil(WORD_BITS) as usize;
        let mut bits = Vec::new();
        bits.try_reserve_exact(words)
            .map_err(|_| BondError::Alloc("slide window bitmap"))?;
        bits.resize(words, 0);
        Ok(Self {
            bits,
            total_size,
            window_size,
            head: head % total_size,
        })
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    fn bit(&self, seq: u32) -> bool {
        self.bits[(seq / WORD_BITS) as usize] & (1 << (seq % WORD_BITS)) != 0
    }

    fn set(&mut self, seq: u32) {
        self.bits[(seq / WORD_BITS) as usize] |= 1 << (seq % WORD_BITS);
    }

    fn clear(&mut self, seq: u32) {
        self.bits[(seq / WORD_BITS) as usize] &= !(1 << (seq % WORD_BITS));
    }

    /// Pure range test. Sequences beyond the sequence space are never in
    /// the window.
    pub fn seq_in_window(&self, seq: u32) -> bool {
        seq < self.total_size && in_loop_range(self.head, self.window_size, self.total_size, seq)
    }

    /// In-window and marked.
    pub fn has(&self, seq: u32) -> bool {
        self.seq_in_window(seq) && self.bit(seq)
    }

    /// Mark `seq`, then slide past every contiguous marked sequence at the
    /// head.
    pub fn add(&mut self, seq: u32) -> std::result::Result<(), WindowError> {
        if !self.seq_in_window(seq) {
            return Err(WindowError::OutOfWindow {
                seq,
                head: self.head,
                window_size: self.window_size,
            });
        }
        if self.bit(seq) {
            return Err(WindowError::Duplicate(seq));
        }
        self.set(seq);
        while self.bit(self.head) {
            self.clear(self.head);
            self.head = (self.head + 1) % self.total_size;
        }
        Ok(())
    }

    /// Number of sequences between `head` and `seq`, walking forward.
    pub fn distance_from_head(&self, seq: u32) -> u32 {
        ((seq as u64 + self.total_size as u64 - self.head as u64) % self.total_size as u64) as u32
    }

    /// Sequence numbers currently marked, for diagnostics and tests.
    pub fn marked(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter().enumerate().flat_map(|(w, word)| {
            let word = *word;
            (0..WORD_BITS)
                .filter(move |b| word & (1 << b) != 0)
                .map(move |b| w as u32 * WORD_BITS + b)
        })
    }
}
