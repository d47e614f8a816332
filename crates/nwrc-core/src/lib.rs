//! Connection engine for the NWRC transport.
//!
//! Many named protocols share one TCP (or TLS) stream. Every frame carries a
//! protocol id; ids are positions in a per-connection protocol list, and the
//! client learns the server's assignment through a handshake right after
//! connecting.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐        ┌──────────────────────────────────────────┐
//! │ Client       │        │ Server (accept loop)                     │
//! │  connect     │        │  TCP accept -> TLS accept -> Endpoint    │
//! │  handshake   │        └──────────────────────────────────────────┘
//! └──────┬───────┘                         │
//!        │                                 v
//!        │                 ┌────────────────────────────────┐
//!        └────────────────>│ ConnectionHost                 │
//!                          │  registry, live count, events  │
//!                          └───────────────┬────────────────┘
//!                                          │ owns
//!                                          v
//!                          ┌────────────────────────────────┐
//!                          │ Endpoint                       │
//!                          │  dispatch loop ─> ProtocolList │
//!                          │  writer task   <─ MessageWriter│
//!                          └────────────────────────────────┘
//! ```
//!
//! - [`Protocol`]: handler for one logical protocol; fixed-length or
//!   self-delimiting payloads
//! - [`ProtocolRegistry`]: named [`ProtocolGroup`] factories
//! - [`Reply`] and [`SessionTable`]: request/response correlation on id 0
//! - [`Handshake`]: protocol table exchange on id 1
//! - [`Endpoint`]: dispatch loop, write lock, lifecycle
//! - [`ConnectionHost`]: live endpoint registry with lazy compaction
//! - [`Client`] / [`Server`]: connection establishment, optionally over TLS
//!
//! Logging goes through `tracing`; the embedding binary chooses a subscriber.

pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod reply;
pub mod server;
pub mod tls;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use client::Client;
pub use config::{ClientConfig, DEFAULT_HANDSHAKE_TIMEOUT, ServerConfig};
pub use connection::{AsyncStream, BoxedStream, Connection};
pub use endpoint::{Endpoint, EndpointId, EndpointState};
pub use error::{NegotiationError, ReplyError, Result, TransportError};
pub use framing::{CHUNK_SIZE, MessageWriter, ReceiveBuffer, Request};
pub use handshake::{Handshake, HandshakeGroup};
pub use host::{AcceptStage, ConnectionEvent, ConnectionHost};
pub use protocol::{Protocol, ProtocolList, SELF_DELIMITING, StubProtocol};
pub use registry::{ProtocolGroup, ProtocolRegistry, StubGroup};
pub use reply::{Reply, ReplyFuture, SessionTable};
pub use server::{RunningServer, Server, ServerProtocols};
pub use tls::{TlsClientOptions, TlsServerOptions, TlsSettings, TlsVersions};

/// Lock a std mutex, ignoring poisoning.
///
/// Every critical section in this crate leaves its data consistent before
/// anything that could panic, so a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
