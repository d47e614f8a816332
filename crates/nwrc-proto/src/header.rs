//! Frame header.
//!
//! Every frame on the wire begins with the same 8 bytes:
//!
//! ```text
//! 0      4      8
//! +------+------+
//! | 4E 57 52 43 | protocol id (u32 BE) |
//! +------+------+
//! ```
//!
//! The reader validates the marker as soon as the first four bytes arrive
//! (see [`FrameHeader::check_magic`]) so that a peer speaking some other
//! protocol is rejected without waiting for the rest of the header.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{BigEndian, U32},
};

use crate::errors::{ProtocolError, Result};

/// Fixed 8-byte header in front of every frame.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct FrameHeader {
    magic: U32<BigEndian>,
    protocol_id: U32<BigEndian>,
}

impl FrameHeader {
    /// Size of the encoded header in bytes.
    pub const SIZE: usize = 8;

    /// Size of the magic marker prefix in bytes.
    pub const MAGIC_SIZE: usize = 4;

    /// Magic marker, `"NWRC"` when read as ASCII.
    pub const MAGIC: u32 = 0x4E57_5243;

    /// Create a header addressed to `protocol_id`.
    pub fn new(protocol_id: u32) -> Self {
        Self { magic: U32::new(Self::MAGIC), protocol_id: U32::new(protocol_id) }
    }

    /// Validate the leading magic marker of a frame.
    pub fn check_magic(prefix: [u8; Self::MAGIC_SIZE]) -> Result<()> {
        let found = u32::from_be_bytes(prefix);
        if found == Self::MAGIC {
            Ok(())
        } else {
            Err(ProtocolError::BadMagic { expected: Self::MAGIC, found })
        }
    }

    /// Parse a header from the first [`Self::SIZE`] bytes of `bytes`.
    ///
    /// Trailing bytes are ignored; they belong to the payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Some(prefix) = bytes.get(..Self::SIZE) else {
            return Err(ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() });
        };

        let header = Self::read_from_bytes(prefix)
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: prefix.len() })?;
        Self::check_magic(header.magic.get().to_be_bytes())?;
        Ok(header)
    }

    /// Protocol id this frame is addressed to.
    pub fn protocol_id(&self) -> u32 {
        self.protocol_id.get()
    }

    /// Encoded form of the header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}
