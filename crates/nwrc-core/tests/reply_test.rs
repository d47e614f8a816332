//! Reply correlation integration tests.
//!
//! Two endpoints share a host (and therefore a session table) and talk over an
//! in-memory pipe. One side allocates sessions, the other answers them through
//! the Reply protocol.

use std::{sync::Arc, time::Duration};

use nwrc_core::{
    Connection, ConnectionHost, Endpoint, ProtocolList, ReplyError, StubProtocol, TransportError,
};
use nwrc_proto::{FrameHeader, HANDSHAKE_PROTOCOL_NAME, MAX_PAYLOAD_SIZE, ReplyHeader};
use tokio::{io::AsyncWriteExt, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

fn bootstrap() -> ProtocolList {
    ProtocolList::bootstrap(Box::new(StubProtocol::new(HANDSHAKE_PROTOCOL_NAME)), Vec::new())
}

fn pair(host: &Arc<ConnectionHost>) -> (Endpoint, Endpoint) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let left = host.add(Connection::new(a, None), bootstrap());
    let right = host.add(Connection::new(b, None), bootstrap());
    (left, right)
}

#[tokio::test]
async fn reply_completes_session() {
    let host = Arc::new(ConnectionHost::new());
    let (left, right) = pair(&host);

    let (session_id, reply) = left.alloc_session();
    right.send_reply(session_id, b"payload").await.unwrap();

    let payload = timeout(WAIT, reply).await.expect("reply arrived").unwrap();
    assert_eq!(&payload[..], b"payload");
    assert_eq!(host.sessions().pending_count(), 0);
}

#[tokio::test]
async fn large_reply_spans_many_chunks() {
    let host = Arc::new(ConnectionHost::new());
    let (left, right) = pair(&host);
    let body: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();

    let (session_id, reply) = left.alloc_session();
    right.send_reply(session_id, &body).await.unwrap();

    let payload = timeout(WAIT, reply).await.expect("reply arrived").unwrap();
    assert_eq!(&payload[..], &body[..]);
}

#[tokio::test]
async fn concurrent_sessions_are_matched_by_id() {
    let host = Arc::new(ConnectionHost::new());
    let (left, right) = pair(&host);

    let sessions: Vec<_> = (0..50).map(|_| left.alloc_session()).collect();

    // Answer in reverse order, each with its own id as payload
    for (session_id, _) in sessions.iter().rev() {
        let right = right.clone();
        let session_id = *session_id;
        tokio::spawn(async move {
            right.send_reply(session_id, &session_id.to_be_bytes()).await.unwrap();
        });
    }

    for (session_id, reply) in sessions {
        let payload = timeout(WAIT, reply).await.expect("reply arrived").unwrap();
        assert_eq!(&payload[..], &session_id.to_be_bytes());
    }
}

#[tokio::test]
async fn unknown_session_is_dropped_without_closing() {
    let host = Arc::new(ConnectionHost::new());
    let (left, right) = pair(&host);

    right.send_reply(9_999, b"stray").await.unwrap();

    let (session_id, reply) = left.alloc_session();
    right.send_reply(session_id, b"real").await.unwrap();

    let payload = timeout(WAIT, reply).await.expect("reply arrived").unwrap();
    assert_eq!(&payload[..], b"real");
    assert!(left.is_valid());
}

#[tokio::test]
async fn close_cancels_owned_sessions() {
    let host = Arc::new(ConnectionHost::new());
    let (left, _right) = pair(&host);

    let (_, reply) = left.alloc_session();
    timeout(WAIT, left.close()).await.expect("closed");

    assert_eq!(timeout(WAIT, reply).await.expect("resolved"), Err(ReplyError::Cancelled));
    assert_eq!(host.sessions().pending_count(), 0);
}

#[tokio::test]
async fn session_allocated_after_close_is_cancelled() {
    let host = Arc::new(ConnectionHost::new());
    let (left, _right) = pair(&host);
    timeout(WAIT, left.close()).await.expect("closed");

    let (_, reply) = left.alloc_session();
    assert_eq!(timeout(WAIT, reply).await.expect("resolved"), Err(ReplyError::Cancelled));
}

#[tokio::test]
async fn oversized_reply_header_closes_connection() {
    let host = Arc::new(ConnectionHost::new());
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let endpoint = host.add(Connection::new(local, None), bootstrap());

    let mut bytes = FrameHeader::new(0).to_bytes().to_vec();
    bytes.extend(ReplyHeader::new(1, MAX_PAYLOAD_SIZE + 1).to_bytes());
    remote.write_all(&bytes).await.unwrap();

    timeout(WAIT, endpoint.wait_closed()).await.expect("endpoint closed");
    assert_eq!(host.count_connections(), 0);
}

#[tokio::test]
async fn oversized_outgoing_reply_is_rejected() {
    let host = Arc::new(ConnectionHost::new());
    let (left, _right) = pair(&host);

    let body = vec![0u8; MAX_PAYLOAD_SIZE as usize + 1];
    let result = left.send_reply(1, &body).await;
    assert!(matches!(result, Err(TransportError::Framing(_))));
    assert!(left.is_valid());
}
