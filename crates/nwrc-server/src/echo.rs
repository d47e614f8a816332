//! Echo protocol.
//!
//! Request and response layout:
//!
//! ```text
//! request  := SessionId (u32) | Length (u32) | Bytes[Length]
//! response := Reply(SessionId, Bytes)
//! ```
//!
//! The server half answers every request with the bytes it received. The
//! client half is a stub: responses come back through Reply, never on the
//! Echo id.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nwrc_core::{
    Client, Protocol, ProtocolGroup, ProtocolRegistry, Request, Result, StubProtocol,
    TransportError,
};
use nwrc_proto::{MAX_PAYLOAD_SIZE, ProtocolError};
use tracing::trace;

/// Name the Echo protocol registers and negotiates under.
pub const ECHO_PROTOCOL_NAME: &str = "Echo";

/// Factory for both Echo halves.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoGroup;

impl ProtocolGroup for EchoGroup {
    fn client_side(&self) -> Box<dyn Protocol> {
        Box::new(StubProtocol::new(ECHO_PROTOCOL_NAME))
    }

    fn server_side(&self) -> Box<dyn Protocol> {
        Box::new(EchoResponder::default())
    }
}

/// Register [`EchoGroup`] under [`ECHO_PROTOCOL_NAME`].
pub fn register(registry: &ProtocolRegistry) {
    registry.register(ECHO_PROTOCOL_NAME, Arc::new(EchoGroup));
}

/// Server half of Echo.
#[derive(Debug, Default)]
pub struct EchoResponder {
    served: u64,
}

#[async_trait]
impl Protocol for EchoResponder {
    fn name(&self) -> &str {
        ECHO_PROTOCOL_NAME
    }

    async fn handle(&mut self, request: &mut Request<'_>) -> Result<()> {
        let session_id = request.read_u32().await?;
        let length = request.read_u32().await?;
        if length > MAX_PAYLOAD_SIZE {
            let error = ProtocolError::PayloadTooLarge { size: length, max: MAX_PAYLOAD_SIZE };
            return Err(error.into());
        }

        let body = request.read_bytes(length as usize).await?;
        self.served += 1;
        trace!(
            endpoint = %request.endpoint().id(),
            session_id,
            length,
            served = self.served,
            "echo"
        );
        request.endpoint().send_reply(session_id, &body).await
    }
}

/// Send `payload` to the server's Echo and wait for it to come back.
pub async fn echo(client: &Client, payload: &[u8]) -> Result<Bytes> {
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|length| *length <= MAX_PAYLOAD_SIZE)
        .ok_or_else(|| {
            TransportError::from(ProtocolError::PayloadTooLarge {
                size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            })
        })?;

    let protocol_id = client
        .protocol_id(ECHO_PROTOCOL_NAME)
        .ok_or_else(|| TransportError::UnknownProtocolGroup(ECHO_PROTOCOL_NAME.to_string()))?;
    let (session_id, reply) = client.alloc_session();

    let mut message = client.create_message(protocol_id).await?;
    message.write_u32(session_id);
    message.write_u32(length);
    message.write(payload);
    message.finish().await?;

    Ok(reply.await?)
}
