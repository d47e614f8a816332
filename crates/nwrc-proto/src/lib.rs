//! Wire format for the NWRC transport.
//!
//! A single duplex stream carries frames for many logical protocols. Each
//! frame starts with a fixed 8-byte header (magic marker plus the negotiated
//! protocol id) and is followed by a payload whose layout belongs to the
//! protocol that owns the id:
//!
//! ```text
//! Frame          := MAGIC (4E 57 52 43) | ProtocolId (u32) | Payload
//! Reply payload  := SessionId (u32) | Length (u32) | Bytes[Length]
//! Handshake req  := SessionId (u32)
//! Handshake resp := CBOR array of { name, id } (carried inside a Reply)
//! ```
//!
//! All integers are big-endian. Headers are parsed through `zerocopy` layouts
//! so malformed input is rejected before anything is copied out of it.
//!
//! This crate does no I/O. Reading and writing frames over a live stream is
//! handled by `nwrc-core`.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod header;
pub mod reply;
pub mod table;

pub use errors::{ProtocolError, Result};
pub use header::FrameHeader;
pub use reply::ReplyHeader;
pub use table::{ProtocolEntry, ProtocolTable};

/// Protocol id permanently assigned to the Reply correlation protocol.
pub const REPLY_PROTOCOL_ID: u32 = 0;

/// Protocol id permanently assigned to the Handshake protocol.
pub const HANDSHAKE_PROTOCOL_ID: u32 = 1;

/// Name the Reply protocol reports during negotiation.
pub const REPLY_PROTOCOL_NAME: &str = "Reply";

/// Name the built-in Handshake protocol reports during negotiation.
pub const HANDSHAKE_PROTOCOL_NAME: &str = "Handshake";

/// Largest Reply payload accepted from the wire (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
