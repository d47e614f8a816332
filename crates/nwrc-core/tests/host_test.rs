//! Connection host integration tests.
//!
//! Exercises the live count and lazy registry compaction under connection
//! churn, including endpoints that are still closing when a sweep runs, plus
//! loopback TCP through [`Server`] and [`Client`].

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use nwrc_core::{
    Client, ClientConfig, Connection, ConnectionEvent, ConnectionHost, Endpoint, EndpointState,
    Protocol, ProtocolList, ProtocolRegistry, Request, Server, ServerConfig, StubGroup,
    StubProtocol,
};
use nwrc_proto::{FrameHeader, HANDSHAKE_PROTOCOL_NAME};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::Notify,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

fn bootstrap() -> ProtocolList {
    ProtocolList::bootstrap(Box::new(StubProtocol::new(HANDSHAKE_PROTOCOL_NAME)), Vec::new())
}

fn add(host: &Arc<ConnectionHost>) -> (Endpoint, DuplexStream) {
    let (local, remote) = tokio::io::duplex(1024);
    (host.add(Connection::new(local, None), bootstrap()), remote)
}

#[tokio::test]
async fn count_tracks_open_and_close() {
    let host = Arc::new(ConnectionHost::new());
    let mut pairs: Vec<_> = (0..10).map(|_| add(&host)).collect();
    assert_eq!(host.count_connections(), 10);

    for (endpoint, _) in pairs.drain(..4) {
        timeout(WAIT, endpoint.close()).await.expect("closed");
    }
    assert_eq!(host.count_connections(), 6);
    assert_eq!(host.endpoints().len(), 6);
}

#[tokio::test]
async fn registry_is_compacted_under_churn() {
    let host = Arc::new(ConnectionHost::new());
    let _persistent: Vec<_> = (0..2).map(|_| add(&host)).collect();

    for _ in 0..5 {
        let churn: Vec<_> = (0..20).map(|_| add(&host)).collect();
        for (endpoint, _) in &churn {
            timeout(WAIT, endpoint.close()).await.expect("closed");
        }
        assert_eq!(host.count_connections(), 2);
        // Sweeps happen once live drops below a quarter of the registry
        assert!(host.registry_len() < 4 * host.count_connections() + 4);
    }
}

/// Asks for a close, then keeps the dispatch loop busy until released.
struct Lingering {
    release: Arc<Notify>,
}

#[async_trait]
impl Protocol for Lingering {
    fn name(&self) -> &str {
        "Lingering"
    }

    fn expected_length(&self) -> usize {
        1
    }

    async fn handle(&mut self, request: &mut Request<'_>) -> nwrc_core::Result<()> {
        request.close_connection();
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn closing_endpoints_survive_compaction() {
    let host = Arc::new(ConnectionHost::new());
    let release = Arc::new(Notify::new());
    let (local, mut remote) = tokio::io::duplex(1024);
    let protocols = ProtocolList::bootstrap(
        Box::new(StubProtocol::new(HANDSHAKE_PROTOCOL_NAME)),
        vec![Box::new(Lingering { release: Arc::clone(&release) }) as Box<dyn Protocol>],
    );
    let lingering = host.add(Connection::new(local, None), protocols);

    let mut frame = FrameHeader::new(2).to_bytes().to_vec();
    frame.push(0);
    remote.write_all(&frame).await.unwrap();
    timeout(WAIT, async {
        while lingering.state() != EndpointState::Closing {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("handler asked to close");

    let churn: Vec<_> = (0..20).map(|_| add(&host)).collect();
    for (endpoint, _) in &churn {
        timeout(WAIT, endpoint.close()).await.expect("closed");
        assert!(host.count_connections() <= host.registry_len());
    }
    assert_eq!(host.count_connections(), 1);
    assert_eq!(host.registry_len(), 1);

    release.notify_one();
    timeout(WAIT, lingering.wait_closed()).await.expect("closed");
    assert_eq!(host.count_connections(), 0);
    assert_eq!(host.registry_len(), 0);
}

#[tokio::test]
async fn concurrent_closes_are_counted_exactly() {
    let host = Arc::new(ConnectionHost::new());
    let pairs: Vec<_> = (0..50).map(|_| add(&host)).collect();

    let closes: Vec<_> = pairs
        .iter()
        .map(|(endpoint, _)| {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.close().await })
        })
        .collect();
    for close in closes {
        timeout(WAIT, close).await.expect("closed").unwrap();
    }

    assert_eq!(host.count_connections(), 0);
    assert_eq!(host.registry_len(), 0);
}

#[tokio::test]
async fn loopback_server_and_client() {
    let registry = Arc::new(ProtocolRegistry::new());
    registry.register("Alpha", Arc::new(StubGroup::new("Alpha")));
    let server_host = Arc::new(ConnectionHost::new());
    let client_host = Arc::new(ConnectionHost::new());
    let mut events = server_host.subscribe();

    let server = Server::start(
        ServerConfig::new(0)
            .with_bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_groups(["Alpha"])
            .with_registry(Arc::clone(&registry))
            .with_host(Arc::clone(&server_host)),
    )
    .await
    .unwrap();

    let config = ClientConfig::new("127.0.0.1", server.local_addr().port())
        .with_groups(["Alpha"])
        .with_registry(Arc::clone(&registry))
        .with_host(Arc::clone(&client_host));
    let client = timeout(WAIT, Client::connect(&config)).await.expect("connected").unwrap();

    assert_eq!(client.protocol_id("Alpha"), Some(2));
    assert!(matches!(
        timeout(WAIT, events.recv()).await.expect("event").unwrap(),
        ConnectionEvent::Connected { peer: Some(_), .. }
    ));
    assert_eq!(server.endpoints().len(), 1);

    timeout(WAIT, server.shutdown()).await.expect("server stopped");
    timeout(WAIT, client.endpoint().wait_closed()).await.expect("client saw close");
    assert_eq!(server_host.count_connections(), 0);
    assert_eq!(client_host.count_connections(), 0);
}
