//! Protocol-id negotiation.
//!
//! Right after connecting, the client asks the server for its protocol table:
//!
//! ```text
//! client                                server
//!   │  frame(id=1): SessionId (u32)       │
//!   │────────────────────────────────────>│
//!   │                                     │ encode table
//!   │  frame(id=0): Reply(SessionId,      │
//!   │               CBOR [{name, id}..])  │
//!   │<────────────────────────────────────│
//!   │ reorder local protocols             │
//! ```
//!
//! Both messages travel on the fixed bootstrap ids, so nothing else needs to
//! be agreed beforehand. The exchange is pluggable through
//! [`HandshakeGroup`]; [`Handshake`] is the built-in implementation.

use std::sync::Arc;

use async_trait::async_trait;
use nwrc_proto::{HANDSHAKE_PROTOCOL_ID, HANDSHAKE_PROTOCOL_NAME, ProtocolTable};
use tracing::debug;

use crate::{
    endpoint::Endpoint,
    error::Result,
    framing::Request,
    protocol::{Protocol, StubProtocol},
    reply::Reply,
};

/// A negotiation exchange and the protocols that carry it.
#[async_trait]
pub trait HandshakeGroup: Send + Sync + 'static {
    /// Name reported for the handshake protocol. Always bound at id 1.
    fn name(&self) -> &str;

    /// Instance bound at id 1 on the client.
    fn client_side(&self) -> Box<dyn Protocol>;

    /// Instance bound at id 1 on the server, answering with `table`.
    fn server_side(&self, table: Arc<ProtocolTable>) -> Box<dyn Protocol>;

    /// Run the client half over `endpoint` and return the server's table.
    async fn execute(&self, endpoint: &Endpoint) -> Result<ProtocolTable>;
}

/// Built-in handshake: one Reply-correlated request for the CBOR table.
#[derive(Debug, Clone, Copy, Default)]
pub struct Handshake;

#[async_trait]
impl HandshakeGroup for Handshake {
    fn name(&self) -> &str {
        HANDSHAKE_PROTOCOL_NAME
    }

    fn client_side(&self) -> Box<dyn Protocol> {
        Box::new(StubProtocol::new(HANDSHAKE_PROTOCOL_NAME))
    }

    fn server_side(&self, table: Arc<ProtocolTable>) -> Box<dyn Protocol> {
        Box::new(HandshakeResponder { table })
    }

    async fn execute(&self, endpoint: &Endpoint) -> Result<ProtocolTable> {
        request_table(endpoint).await
    }
}

/// Send the table request and wait for the server's answer.
pub async fn request_table(endpoint: &Endpoint) -> Result<ProtocolTable> {
    let (session_id, reply) = endpoint.alloc_session();

    let mut message = endpoint.create_message(HANDSHAKE_PROTOCOL_ID).await?;
    message.write_u32(session_id);
    message.finish().await?;
    debug!(endpoint = %endpoint.id(), session_id, "handshake requested");

    let payload = reply.await?;
    Ok(ProtocolTable::decode(&payload)?)
}

/// Server half: answers every request with the same table.
struct HandshakeResponder {
    table: Arc<ProtocolTable>,
}

#[async_trait]
impl Protocol for HandshakeResponder {
    fn name(&self) -> &str {
        HANDSHAKE_PROTOCOL_NAME
    }

    fn expected_length(&self) -> usize {
        4
    }

    async fn handle(&mut self, request: &mut Request<'_>) -> Result<()> {
        let session_id = request.read_u32().await?;
        let encoded = self.table.encode()?;
        debug!(
            endpoint = %request.endpoint().id(),
            session_id,
            protocols = self.table.len(),
            "answering handshake"
        );
        Reply::send(request.endpoint(), session_id, &encoded).await
    }
}
