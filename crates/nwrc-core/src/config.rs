//! Client and server configuration.
//!
//! Both configs default to the process-wide [`ProtocolRegistry`] and
//! [`ConnectionHost`], the built-in [`Handshake`] and plaintext TCP. Tests and
//! embedders that want isolation swap in their own registry and host.

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use crate::{
    handshake::{Handshake, HandshakeGroup},
    host::ConnectionHost,
    registry::ProtocolRegistry,
    tls::{TlsClientOptions, TlsServerOptions},
};

/// Time the client waits for the handshake response.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for an outgoing connection.
#[derive(Clone)]
pub struct ClientConfig {
    /// Host name or address to connect to
    pub address: String,
    /// TCP port
    pub port: u16,
    /// Registry names of the protocol groups to bind, in local order
    pub protocol_groups: Vec<String>,
    /// Negotiation exchange
    pub handshake: Arc<dyn HandshakeGroup>,
    /// TLS settings; `None` for plaintext
    pub tls: Option<TlsClientOptions>,
    /// Upper bound on waiting for the handshake response
    pub handshake_timeout: Duration,
    /// Where protocol groups are looked up
    pub registry: Arc<ProtocolRegistry>,
    /// Where the endpoint is registered
    pub host: Arc<ConnectionHost>,
}

impl ClientConfig {
    /// Plaintext connection to `address:port` with no extra protocols.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            protocol_groups: Vec::new(),
            handshake: Arc::new(Handshake),
            tls: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            registry: ProtocolRegistry::global(),
            host: ConnectionHost::global(),
        }
    }

    /// Bind these protocol groups after the bootstrap pair.
    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocol_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Use a custom negotiation exchange.
    #[must_use]
    pub fn with_handshake(mut self, handshake: Arc<dyn HandshakeGroup>) -> Self {
        self.handshake = handshake;
        self
    }

    /// Connect over TLS.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsClientOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Override the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Look groups up in `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ProtocolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Register the endpoint with `host`.
    #[must_use]
    pub fn with_host(mut self, host: Arc<ConnectionHost>) -> Self {
        self.host = host;
        self
    }
}

/// Settings for a listening server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Interface to bind
    pub bind: IpAddr,
    /// TCP port; 0 picks a free one
    pub port: u16,
    /// Registry names of the protocol groups to serve; ids follow this order
    pub protocol_groups: Vec<String>,
    /// Negotiation exchange
    pub handshake: Arc<dyn HandshakeGroup>,
    /// TLS settings; `None` for plaintext
    pub tls: Option<TlsServerOptions>,
    /// Where protocol groups are looked up
    pub registry: Arc<ProtocolRegistry>,
    /// Where accepted endpoints are registered
    pub host: Arc<ConnectionHost>,
}

impl ServerConfig {
    /// Plaintext listener on all interfaces.
    pub fn new(port: u16) -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            protocol_groups: Vec::new(),
            handshake: Arc::new(Handshake),
            tls: None,
            registry: ProtocolRegistry::global(),
            host: ConnectionHost::global(),
        }
    }

    /// Listen on `bind` instead of all interfaces.
    #[must_use]
    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Serve these protocol groups after the bootstrap pair.
    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocol_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Use a custom negotiation exchange.
    #[must_use]
    pub fn with_handshake(mut self, handshake: Arc<dyn HandshakeGroup>) -> Self {
        self.handshake = handshake;
        self
    }

    /// Require TLS on every accepted connection.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsServerOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Look groups up in `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ProtocolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Register accepted endpoints with `host`.
    #[must_use]
    pub fn with_host(mut self, host: Arc<ConnectionHost>) -> Self {
        self.host = host;
        self
    }
}
