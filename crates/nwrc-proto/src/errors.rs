//! Error types for wire format parsing and encoding.

use thiserror::Error;

/// Result alias used throughout the wire format crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Failures while decoding or encoding wire data.
///
/// Every variant except `Encode` describes bytes received from a peer. The
/// transport treats those as framing errors and tears the connection down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The first four bytes of a frame were not the magic marker.
    #[error("bad magic marker: expected {expected:#010x}, found {found:#010x}")]
    BadMagic {
        /// Marker the protocol requires
        expected: u32,
        /// Marker actually received
        found: u32,
    },

    /// Fewer bytes were supplied than the layout requires.
    #[error("truncated input: need {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the layout
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// A declared payload length exceeds the configured limit.
    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// Declared size
        size: u32,
        /// Maximum allowed size
        max: u32,
    },

    /// A structured payload could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(String),

    /// A structured payload could not be deserialized.
    #[error("failed to decode payload: {0}")]
    Decode(String),
}
