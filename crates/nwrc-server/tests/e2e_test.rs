//! End-to-end tests over loopback TCP.
//!
//! Tests the complete flow: listener, optional TLS, handshake, Echo through
//! Reply correlation, and shutdown.

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use nwrc_core::{
    AcceptStage, Client, ClientConfig, ConnectionEvent, ConnectionHost, ProtocolRegistry,
    ReplyError, RunningServer, Server, ServerConfig, TlsClientOptions, TlsServerOptions,
    TlsSettings, TransportError,
};
use nwrc_server::{ECHO_PROTOCOL_NAME, cert, cli, echo};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

struct Fixture {
    registry: Arc<ProtocolRegistry>,
    server_host: Arc<ConnectionHost>,
    client_host: Arc<ConnectionHost>,
    server: RunningServer,
}

impl Fixture {
    async fn start(tls: Option<TlsServerOptions>) -> Self {
        let registry = cli::registry();
        let server_host = Arc::new(ConnectionHost::new());
        let mut config = ServerConfig::new(0)
            .with_bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_groups([ECHO_PROTOCOL_NAME])
            .with_registry(Arc::clone(&registry))
            .with_host(Arc::clone(&server_host));
        if let Some(tls) = tls {
            config = config.with_tls(tls);
        }

        let server = Server::start(config).await.expect("server started");
        Self { registry, server_host, client_host: Arc::new(ConnectionHost::new()), server }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.server.local_addr().port())
            .with_groups([ECHO_PROTOCOL_NAME])
            .with_registry(Arc::clone(&self.registry))
            .with_host(Arc::clone(&self.client_host))
    }

    async fn connect(&self, config: &ClientConfig) -> Result<Client, TransportError> {
        timeout(WAIT, Client::connect(config)).await.expect("connect finished")
    }
}

fn tls_pair() -> (TlsServerOptions, TlsClientOptions) {
    let identity = cert::self_signed(&["localhost".to_string()]).unwrap();
    let roots = cert::root_store(&identity.certs).unwrap();
    let server =
        TlsServerOptions::from_pem_parts(identity.certs, identity.key, &TlsSettings::default())
            .unwrap();
    let client = TlsClientOptions::with_roots("localhost", roots).unwrap();
    (server, client)
}

#[tokio::test]
async fn plaintext_echo() {
    let fixture = Fixture::start(None).await;
    let client = fixture.connect(&fixture.config()).await.unwrap();

    assert_eq!(client.protocol_id(ECHO_PROTOCOL_NAME), Some(2));
    let reply = timeout(WAIT, echo(&client, b"hello")).await.unwrap().unwrap();
    assert_eq!(&reply[..], b"hello");

    assert_eq!(fixture.server_host.count_connections(), 1);
    assert_eq!(fixture.client_host.count_connections(), 1);
    client.close().await;
}

#[tokio::test]
async fn large_payload_echo() {
    let fixture = Fixture::start(None).await;
    let client = fixture.connect(&fixture.config()).await.unwrap();
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i * 7 % 256) as u8).collect();

    let reply = timeout(WAIT, echo(&client, &payload)).await.unwrap().unwrap();
    assert_eq!(&reply[..], &payload[..]);
    client.close().await;
}

#[tokio::test]
async fn pipelined_requests_on_one_connection() {
    let fixture = Fixture::start(None).await;
    let client = Arc::new(fixture.connect(&fixture.config()).await.unwrap());

    let tasks: Vec<_> = (0..32u32)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let payload = vec![i as u8; (i as usize + 1) * 300];
                let reply = echo(&client, &payload).await.unwrap();
                assert_eq!(&reply[..], &payload[..]);
            })
        })
        .collect();
    for task in tasks {
        timeout(WAIT, task).await.unwrap().unwrap();
    }
    client.close().await;
}

#[tokio::test]
async fn many_clients_share_one_server() {
    let fixture = Fixture::start(None).await;
    let mut clients = Vec::new();
    for _ in 0..8 {
        clients.push(fixture.connect(&fixture.config()).await.unwrap());
    }
    assert_eq!(fixture.client_host.count_connections(), 8);

    for (i, client) in clients.iter().enumerate() {
        let payload = format!("client {i}");
        let reply = timeout(WAIT, echo(client, payload.as_bytes())).await.unwrap().unwrap();
        assert_eq!(&reply[..], payload.as_bytes());
    }

    fixture.server.shutdown().await;
    for client in &clients {
        timeout(WAIT, client.endpoint().wait_closed()).await.expect("client closed");
    }
    assert_eq!(fixture.server_host.count_connections(), 0);
    assert_eq!(fixture.client_host.count_connections(), 0);
}

#[tokio::test]
async fn tls_echo_with_self_signed_certificate() {
    let (server_tls, client_tls) = tls_pair();
    let fixture = Fixture::start(Some(server_tls)).await;
    let client = fixture.connect(&fixture.config().with_tls(client_tls)).await.unwrap();

    assert!(client.endpoint().is_secure());
    let reply = timeout(WAIT, echo(&client, b"secret")).await.unwrap().unwrap();
    assert_eq!(&reply[..], b"secret");
    client.close().await;
}

#[tokio::test]
async fn plaintext_client_is_rejected_by_tls_server() {
    let (server_tls, _) = tls_pair();
    let fixture = Fixture::start(Some(server_tls)).await;
    let mut events = fixture.server_host.subscribe();

    let result = fixture.connect(&fixture.config().with_handshake_timeout(WAIT / 2)).await;
    // The server hangs up during its TLS step, so the handshake request is
    // cancelled by the closed stream rather than rejected or timed out
    let error = result.unwrap_err();
    assert!(
        matches!(
            error,
            TransportError::Reply(ReplyError::Cancelled)
                | TransportError::ConnectionClosed
                | TransportError::Io(_)
        ),
        "unexpected error: {error}"
    );

    let event = timeout(WAIT, events.recv()).await.expect("event").unwrap();
    assert!(matches!(event, ConnectionEvent::AcceptFailed { stage: AcceptStage::Tls, .. }));
    assert_eq!(fixture.server_host.count_connections(), 0);
    assert_eq!(fixture.client_host.count_connections(), 0);
}

#[tokio::test]
async fn untrusted_certificate_fails_tls() {
    let (server_tls, _) = tls_pair();
    let (_, other_client_tls) = tls_pair();
    let fixture = Fixture::start(Some(server_tls)).await;

    let result = fixture.connect(&fixture.config().with_tls(other_client_tls)).await;
    assert!(matches!(result, Err(TransportError::Tls(_))));
}

#[tokio::test]
async fn server_without_echo_fails_negotiation() {
    let registry = cli::registry();
    let server = Server::start(
        ServerConfig::new(0)
            .with_bind(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_registry(Arc::clone(&registry))
            .with_host(Arc::new(ConnectionHost::new())),
    )
    .await
    .unwrap();

    let config = ClientConfig::new("127.0.0.1", server.local_addr().port())
        .with_groups([ECHO_PROTOCOL_NAME])
        .with_registry(registry)
        .with_host(Arc::new(ConnectionHost::new()));
    let result = timeout(WAIT, Client::connect(&config)).await.unwrap();
    assert!(matches!(result, Err(TransportError::Negotiation(_))));

    server.shutdown().await;
}
