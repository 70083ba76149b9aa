//! Out-of-band header prefixed to every bonded payload.
//!
//! The receiver reads the header back to apply sliding-window dedup and to
//! decide whether the payload goes through the strongly-ordered queue.
//!
//! # Format
//!
//! All multi-byte fields use network byte order (big-endian):
//! - Message sequence number (4 bytes)
//! - Strongly-ordered flag (1 byte): 0 or 1
//! - Reserved (3 bytes): zero
//!
//! Total header size: 8 bytes

/// Flag byte value for a strongly-ordered payload.
pub const FLAG_STRONGLY_ORDERED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BondHeader {
    /// Message sequence number on the virtual connection.
    pub msn: u32,
    /// Payload must be released in msn order.
    pub strongly_ordered: bool,
}

impl BondHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 8;

    pub fn new(msn: u32, strongly_ordered: bool) -> Self {
        Self {
            msn,
            strongly_ordered,
        }
    }

    /// Encode header to bytes (network byte order)
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Write the header into the first [`BondHeader::SIZE`] bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..4].copy_from_slice(&self.msn.to_be_bytes());
        buf[4] = if self.strongly_ordered {
            FLAG_STRONGLY_ORDERED
        } else {
            0
        };
        buf[5..8].fill(0);
    }

    /// Decode header from bytes (network byte order)
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        let msn = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let strongly_ordered = match buf[4] {
            0 => false,
            FLAG_STRONGLY_ORDERED => true,
            other => return Err(ProtocolError::InvalidFlags(other)),
        };

        Ok(Self {
            msn,
            strongly_ordered,
        })
    }
}

/// Header decode errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid header length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid flags: 0x{0:02X}")]
    InvalidFlags(u8),
}
