//! Connecting side.
//!
//! [`Client::connect`] opens TCP (optionally TLS), binds Reply, the client half
//! of the handshake and the configured protocol groups, then negotiates ids.
//! The endpoint is registered with the host only after negotiation succeeds.

use bytes::Bytes;
use nwrc_proto::ProtocolTable;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::{
    config::ClientConfig,
    connection::Connection,
    endpoint::Endpoint,
    error::{NegotiationError, Result, TransportError},
    framing::MessageWriter,
    protocol::ProtocolList,
    reply::ReplyFuture,
    tls,
};

/// A negotiated outgoing connection.
///
/// Dropping the client stops its dispatch loop; call [`close`](Self::close)
/// to also wait for cleanup.
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
    table: ProtocolTable,
}

impl Client {
    /// Connect to `config.address:config.port` and negotiate.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let tcp = TcpStream::connect((config.address.as_str(), config.port)).await?;
        let connection = match &config.tls {
            Some(options) => tls::connect(tcp, options).await?,
            None => Connection::plain(tcp),
        };
        Self::with_connection(connection, config).await
    }

    /// Negotiate over an already established stream.
    pub async fn with_connection(connection: Connection, config: &ClientConfig) -> Result<Self> {
        let groups = config.registry.client_side(&config.protocol_groups)?;
        let protocols = ProtocolList::bootstrap(config.handshake.client_side(), groups);
        protocols.check_unique()?;

        let endpoint = config.host.start(connection, protocols);
        let table = match negotiate(&endpoint, config).await {
            Ok(table) => table,
            Err(error) => {
                debug!(endpoint = %endpoint.id(), %error, "negotiation failed");
                endpoint.close().await;
                return Err(error);
            },
        };

        if !config.host.register(&endpoint) {
            return Err(TransportError::ConnectionClosed);
        }
        info!(
            endpoint = %endpoint.id(),
            peer = ?endpoint.peer_addr(),
            protocols = table.len(),
            "client connected"
        );
        Ok(Self { endpoint, table })
    }

    /// Underlying endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Table the server answered with.
    pub fn protocol_table(&self) -> &ProtocolTable {
        &self.table
    }

    /// Negotiated id of the protocol named `name`.
    pub fn protocol_id(&self, name: &str) -> Option<u32> {
        self.table.id_of(name)
    }

    /// Start an outgoing frame to `protocol_id`.
    pub async fn create_message(&self, protocol_id: u32) -> Result<MessageWriter> {
        self.endpoint.create_message(protocol_id).await
    }

    /// Reserve a Reply session on this connection.
    pub fn alloc_session(&self) -> (u32, ReplyFuture) {
        self.endpoint.alloc_session()
    }

    /// Send `body` prefixed by a fresh session id to the protocol named
    /// `name` and wait for its Reply.
    pub async fn request(&self, name: &str, body: &[u8]) -> Result<Bytes> {
        let protocol_id = self
            .protocol_id(name)
            .ok_or_else(|| TransportError::UnknownProtocolGroup(name.to_owned()))?;
        let (session_id, reply) = self.alloc_session();

        let mut message = self.create_message(protocol_id).await?;
        message.write_u32(session_id);
        message.write(body);
        message.finish().await?;

        Ok(reply.await?)
    }

    /// Close the connection and wait for cleanup.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.endpoint.invalidate();
    }
}

async fn negotiate(endpoint: &Endpoint, config: &ClientConfig) -> Result<ProtocolTable> {
    let timeout = config.handshake_timeout;
    let table = tokio::time::timeout(timeout, config.handshake.execute(endpoint))
        .await
        .map_err(|_| NegotiationError::Timeout(timeout))??;

    endpoint.install_table(&table, config.handshake.name()).await?;
    debug!(endpoint = %endpoint.id(), ?table, "negotiated");
    Ok(table)
}
