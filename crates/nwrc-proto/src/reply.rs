//! Reply payload header.
//!
//! A Reply frame (protocol id 0) carries a correlation id and a
//! length-prefixed opaque body. The header is read straight off the stream;
//! the body length tells the reader how many more bytes belong to the frame.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{BigEndian, U32},
};

use crate::{
    MAX_PAYLOAD_SIZE,
    errors::{ProtocolError, Result},
};

/// `SessionId | Length` prefix of every Reply payload.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct ReplyHeader {
    session_id: U32<BigEndian>,
    length: U32<BigEndian>,
}

impl ReplyHeader {
    /// Size of the encoded header in bytes.
    pub const SIZE: usize = 8;

    /// Create a header for `length` body bytes answering `session_id`.
    pub fn new(session_id: u32, length: u32) -> Self {
        Self { session_id: U32::new(session_id), length: U32::new(length) }
    }

    /// Parse and validate a header received from a peer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = Self::read_from_prefix(bytes)
            .map(|(header, _)| header)
            .map_err(|_| ProtocolError::Truncated { expected: Self::SIZE, actual: bytes.len() })?;

        let length = header.length();
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge { size: length, max: MAX_PAYLOAD_SIZE });
        }
        Ok(header)
    }

    /// Session the body answers.
    pub fn session_id(&self) -> u32 {
        self.session_id.get()
    }

    /// Number of body bytes following the header.
    pub fn length(&self) -> u32 {
        self.length.get()
    }

    /// Encoded form of the header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn encodes_session_then_length() {
        let header = ReplyHeader::new(0x0102_0304, 5);
        assert_eq!(header.to_bytes(), hex!("01020304 00000005"));
    }

    #[test]
    fn parses_prefix_of_longer_buffer() {
        let mut bytes = ReplyHeader::new(3, 4).to_bytes().to_vec();
        bytes.extend_from_slice(b"body");

        let header = ReplyHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.session_id(), 3);
        assert_eq!(header.length(), 4);
    }

    #[test]
    fn rejects_oversized_body() {
        let bytes = ReplyHeader::new(1, MAX_PAYLOAD_SIZE + 1).to_bytes();
        let result = ReplyHeader::from_bytes(&bytes);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn accepts_body_at_limit() {
        let bytes = ReplyHeader::new(1, MAX_PAYLOAD_SIZE).to_bytes();
        assert!(ReplyHeader::from_bytes(&bytes).is_ok());
    }

    #[test]
    fn rejects_short_input() {
        let result = ReplyHeader::from_bytes(&[0, 0, 0]);
        assert_eq!(result, Err(ProtocolError::Truncated { expected: 8, actual: 3 }));
    }
}
