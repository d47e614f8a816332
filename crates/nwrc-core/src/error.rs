//! Error types for the connection engine.
//!
//! Three layers of failure are kept apart:
//! - [`TransportError`]: anything that can go wrong on a connection, from I/O
//!   to framing to handler failures
//! - [`NegotiationError`]: the handshake response could not be reconciled with
//!   the local protocol list
//! - [`ReplyError`]: a correlated request will never receive its response

use std::{io, time::Duration};

use nwrc_proto::ProtocolError;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures observed on a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Frame-level violation (bad magic, oversized payload, malformed table)
    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    /// Frame addressed to an identifier with no bound protocol
    #[error("frame addressed to protocol {id} but only {count} protocols are bound")]
    UnknownProtocolId {
        /// Identifier carried by the frame
        id: u32,
        /// Number of protocols bound on the endpoint
        count: usize,
    },

    /// Underlying byte stream failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server name rejected by the TLS layer
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    /// Protocol negotiation failed
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Correlated response will never arrive
    #[error("reply failed: {0}")]
    Reply(#[from] ReplyError),

    /// Requested protocol group is not in the registry
    #[error("no protocol group registered under {0:?}")]
    UnknownProtocolGroup(String),

    /// Endpoint already closed or closing
    #[error("connection closed")]
    ConnectionClosed,

    /// Application handler reported a failure
    #[error("handler for {protocol} failed: {reason}")]
    Handler {
        /// Name of the failing protocol
        protocol: String,
        /// Human-readable failure description
        reason: String,
    },

    /// Invalid configuration supplied by the caller
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Build a handler failure for `protocol`.
    pub fn handler(protocol: impl Into<String>, reason: impl ToString) -> Self {
        Self::Handler { protocol: protocol.into(), reason: reason.to_string() }
    }

    /// Whether the dispatch loop must stop after this error.
    ///
    /// Handler and reply failures leave the stream positioned at a frame
    /// boundary, so the connection survives them. Everything else means the
    /// byte stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Handler { .. } | Self::Reply(_))
    }

    /// Whether this error is just the peer going away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Handshake response could not be applied to the local protocol list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// Server reported a protocol the client does not have
    #[error("server reported unknown protocol {0:?}")]
    UnknownRemoteProtocol(String),

    /// Client has a protocol the server did not report
    #[error("server did not report local protocol {0:?}")]
    MissingRemoteProtocol(String),

    /// Bootstrap protocol not at its fixed identifier
    #[error("bootstrap protocol {name:?} expected at id {expected}, server reported {found:?}")]
    BootstrapMismatch {
        /// Protocol name
        name: String,
        /// Fixed identifier both sides rely on
        expected: u32,
        /// Identifier reported by the server, if any
        found: Option<u32>,
    },

    /// Same name or identifier appears twice
    #[error("protocol {0:?} appears more than once")]
    DuplicateProtocol(String),

    /// Reported identifier does not fit the local list
    #[error("protocol {name:?} reported at id {id} but only {count} protocols exist")]
    IdOutOfRange {
        /// Protocol name
        name: String,
        /// Reported identifier
        id: u32,
        /// Local protocol count
        count: usize,
    },

    /// Server did not answer in time
    #[error("no handshake response within {0:?}")]
    Timeout(Duration),
}

/// Correlated response will never be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    /// Session was cancelled, usually because its connection closed
    #[error("session cancelled before a response arrived")]
    Cancelled,

    /// Response names a session that is not pending
    #[error("no pending session {0}")]
    UnknownSession(u32),
}
