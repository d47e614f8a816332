//! Framed message I/O over a shared duplex stream.
//!
//! # Writing
//!
//! Outgoing bytes never touch the socket from the caller's task. A dedicated
//! writer task owns the write half and drains an ordered queue of
//! write commands:
//!
//! ```text
//! MessageWriter ──Chunk──┐
//! MessageWriter ──Chunk──┼──> queue ──> writer task ──> socket
//! MessageWriter ──Flush──┘                 │
//!        ^                                 │
//!        └──────────── ack ────────────────┘
//! ```
//!
//! A [`MessageWriter`] holds the connection's write lock for its whole
//! lifetime, so the chunks of two messages never interleave. Chunks are
//! queued without waiting for earlier ones to hit the socket; only
//! [`MessageWriter::finish`] waits, and it waits for everything queued before
//! it.
//!
//! # Reading
//!
//! [`FrameReader`] pulls the magic marker and protocol id of the next frame.
//! Fixed-length payloads are then staged whole into a [`ReceiveBuffer`] so the
//! handler sees exactly its payload; self-delimiting protocols read the stream
//! directly through a [`Request`].

mod reader;
mod writer;

pub use reader::{ReceiveBuffer, Request};
pub use writer::{CHUNK_SIZE, MessageWriter};
pub(crate) use reader::FrameReader;
pub(crate) use writer::FrameSink;
