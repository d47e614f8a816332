//! Established byte streams ready to be bound to an endpoint.
//!
//! The engine does not care whether a stream is plain TCP, TLS over TCP, an
//! in-memory duplex pipe or a simulated socket. Anything that reads and writes
//! bytes can be wrapped in a [`Connection`] and handed to the
//! [`ConnectionHost`](crate::ConnectionHost).

use std::{fmt, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tracing::debug;

/// Duplex byte stream the engine can own.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased duplex stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// An established stream plus what is known about the peer.
pub struct Connection {
    stream: BoxedStream,
    peer: Option<SocketAddr>,
    secure: bool,
}

impl Connection {
    /// Wrap an arbitrary stream.
    pub fn new<S: AsyncStream>(stream: S, peer: Option<SocketAddr>) -> Self {
        Self { stream: Box::new(stream), peer, secure: false }
    }

    /// Wrap a TCP stream without encryption.
    ///
    /// Nagle is disabled: frames are flushed explicitly and latency matters
    /// more than packet count.
    pub fn plain(tcp: TcpStream) -> Self {
        let peer = tcp.peer_addr().ok();
        if let Err(error) = tcp.set_nodelay(true) {
            debug!(?peer, %error, "failed to disable nagle");
        }
        Self::new(tcp, peer)
    }

    pub(crate) fn secured<S: AsyncStream>(stream: S, peer: Option<SocketAddr>) -> Self {
        Self { stream: Box::new(stream), peer, secure: true }
    }

    /// Remote address, when the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the stream is wrapped in TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub(crate) fn into_parts(self) -> (BoxedStream, Option<SocketAddr>, bool) {
        (self.stream, self.peer, self.secure)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}
