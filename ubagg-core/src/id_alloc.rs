//! First-fit index allocator backed by a `u64` word bitmap.
//!
//! Used for header scratch slots and anywhere else a small dense id space
//! must be handed out and returned.

use tracing::error;

use crate::error::{BondError, Result};

const WORD_BITS: u32 = u64::BITS;

#[derive(Debug, Clone)]
pub struct IdBitmap {
    words: Vec<u64>,
    size: u32,
    used: u32,
}

impl IdBitmap {
    pub fn new(size: u32) -> Result<Self> {
        let n = size.div_ceil(WORD_BITS) as usize;
        let mut words = Vec::new();
        words
            .try_reserve_exact(n)
            .map_err(|_| BondError::Alloc("id bitmap"))?;
        words.resize(n, 0);
        Ok(Self {
            words,
            size,
            used: 0,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn is_set(&self, id: u32) -> bool {
        id < self.size && self.words[(id / WORD_BITS) as usize] & (1 << (id % WORD_BITS)) != 0
    }

    /// Lowest free index.
    pub fn alloc(&mut self) -> Result<u32> {
        self.alloc_from(0)
    }

    /// Lowest free index at or above `offset`.
    pub fn alloc_from(&mut self, offset: u32) -> Result<u32> {
        if offset >= self.size {
            return Err(BondError::invalid(format!(
                "offset {offset} exceeds bitmap size {}",
                self.size
            )));
        }
        let mut word_idx = (offset / WORD_BITS) as usize;
        // Mask off bits below the offset in the first word.
        let mut word = self.words[word_idx] | ((1u64 << (offset % WORD_BITS)) - 1);
        loop {
            if word != u64::MAX {
                let id = word_idx as u32 * WORD_BITS + word.trailing_ones();
                if id >= self.size {
                    break;
                }
                self.words[word_idx] |= 1 << (id % WORD_BITS);
                self.used += 1;
                return Ok(id);
            }
            word_idx += 1;
            match self.words.get(word_idx) {
                Some(w) => word = *w,
                None => break,
            }
        }
        error!(size = self.size, offset, "id bitmap exhausted");
        Err(BondError::Alloc("id bitmap exhausted"))
    }

    /// Claim a specific id.
    pub fn use_id(&mut self, id: u32) -> Result<()> {
        if id >= self.size {
            return Err(BondError::invalid(format!("id {id} beyond bitmap size {}", self.size)));
        }
        if self.is_set(id) {
            return Err(BondError::Collision("id bitmap"));
        }
        self.words[(id / WORD_BITS) as usize] |= 1 << (id % WORD_BITS);
        self.used += 1;
        Ok(())
    }

    pub fn free(&mut self, id: u32) -> Result<()> {
        if !self.is_set(id) {
            return Err(BondError::not_found("bitmap id", id));
        }
        self.words[(id / WORD_BITS) as usize] &= !(1 << (id % WORD_BITS));
        self.used -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_first_fit() {
        let mut b = IdBitmap::new(130).unwrap();
        assert_eq!(b.alloc().unwrap(), 0);
        assert_eq!(b.alloc().unwrap(), 1);
        b.free(0).unwrap();
        assert_eq!(b.alloc().unwrap(), 0);
        assert_eq!(b.used(), 2);
    }

    #[test]
    fn test_alloc_from_offset_crosses_words() {
        let mut b = IdBitmap::new(130).unwrap();
        assert_eq!(b.alloc_from(63).unwrap(), 63);
        assert_eq!(b.alloc_from(63).unwrap(), 64);
        assert_eq!(b.alloc_from(129).unwrap(), 129);
        assert!(b.alloc_from(129).is_err());
        assert!(matches!(
            b.alloc_from(130),
            Err(BondError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_exhaustion_respects_size() {
        let mut b = IdBitmap::new(3).unwrap();
        for expected in 0..3 {
            assert_eq!(b.alloc().unwrap(), expected);
        }
        assert!(matches!(b.alloc(), Err(BondError::Alloc(_))));
    }

    #[test]
    fn test_use_and_free() {
        let mut b = IdBitmap::new(16).unwrap();
        b.use_id(5).unwrap();
        assert!(b.is_set(5));
        assert!(matches!(b.use_id(5), Err(BondError::Collision(_))));
        assert!(matches!(b.free(6), Err(BondError::NotFound { .. })));
        b.free(5).unwrap();
        assert!(!b.is_set(5));
        assert!(!b.is_set(100));
    }
}
