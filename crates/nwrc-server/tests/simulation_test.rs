//! Simulated-network tests.
//!
//! Runs the server and client halves on separate turmoil hosts so the
//! handshake and Echo round trips cross a deterministic network, including
//! latency and a partition.

use std::{sync::Arc, time::Duration};

use nwrc_core::{
    Client, ClientConfig, Connection, ConnectionHost, Handshake, ServerProtocols, TransportError,
};
use nwrc_server::{ECHO_PROTOCOL_NAME, cli, echo};

const PORT: u16 = 4433;

fn server_protocols() -> Result<ServerProtocols, TransportError> {
    ServerProtocols::new(&cli::registry(), Arc::new(Handshake), &[ECHO_PROTOCOL_NAME.to_string()])
}

/// Serve `connections` clients, then return once they have all hung up.
fn serve(sim: &mut turmoil::Sim<'_>, connections: usize) {
    sim.host("server", move || async move {
        let protocols = server_protocols()?;
        let host = Arc::new(ConnectionHost::new());
        let listener = turmoil::net::TcpListener::bind(("0.0.0.0", PORT)).await?;

        let mut endpoints = Vec::new();
        for _ in 0..connections {
            let (stream, peer) = listener.accept().await?;
            endpoints.push(host.add(Connection::new(stream, Some(peer)), protocols.instantiate()));
        }
        for endpoint in &endpoints {
            endpoint.wait_closed().await;
        }
        assert_eq!(host.count_connections(), 0);
        Ok(())
    });
}

async fn connect(host: &Arc<ConnectionHost>) -> Result<Client, TransportError> {
    let stream = turmoil::net::TcpStream::connect(("server", PORT)).await?;
    let peer = stream.peer_addr().ok();
    let config = ClientConfig::new("server", PORT)
        .with_groups([ECHO_PROTOCOL_NAME])
        .with_registry(cli::registry())
        .with_host(Arc::clone(host))
        .with_handshake_timeout(Duration::from_secs(5));
    Client::with_connection(Connection::new(stream, peer), &config).await
}

#[test]
fn echo_over_simulated_network() -> turmoil::Result {
    let mut sim = turmoil::Builder::new().build();
    serve(&mut sim, 1);

    sim.client("client", async move {
        let host = Arc::new(ConnectionHost::new());
        let client = connect(&host).await?;
        assert_eq!(client.protocol_id(ECHO_PROTOCOL_NAME), Some(2));

        for size in [0, 1, 4096, 100_000] {
            let payload = vec![0xA5; size];
            let reply = echo(&client, &payload).await?;
            assert_eq!(reply.len(), size);
        }

        client.close().await;
        assert_eq!(host.count_connections(), 0);
        Ok(())
    });

    sim.run()
}

#[test]
fn echo_survives_latency() -> turmoil::Result {
    let mut sim = turmoil::Builder::new()
        .min_message_latency(Duration::from_millis(20))
        .max_message_latency(Duration::from_millis(80))
        .build();
    serve(&mut sim, 2);

    for name in ["alice", "bob"] {
        sim.client(name, async move {
            let host = Arc::new(ConnectionHost::new());
            let client = Arc::new(connect(&host).await?);

            let tasks: Vec<_> = (0..8u8)
                .map(|i| {
                    let client = Arc::clone(&client);
                    tokio::spawn(async move { echo(&client, &[i; 64]).await })
                })
                .collect();
            for (i, task) in tasks.into_iter().enumerate() {
                let reply = task.await??;
                assert!(reply.iter().all(|byte| usize::from(*byte) == i));
            }

            client.close().await;
            Ok(())
        });
    }

    sim.run()
}

#[test]
fn partition_during_handshake_times_out() -> turmoil::Result {
    let mut sim = turmoil::Builder::new().build();
    sim.host("server", || async move {
        let protocols = server_protocols()?;
        let host = Arc::new(ConnectionHost::new());
        let listener = turmoil::net::TcpListener::bind(("0.0.0.0", PORT)).await?;
        let (stream, peer) = listener.accept().await?;
        let endpoint = host.add(Connection::new(stream, Some(peer)), protocols.instantiate());
        endpoint.wait_closed().await;
        Ok(())
    });

    sim.client("client", async move {
        let host = Arc::new(ConnectionHost::new());
        let stream = turmoil::net::TcpStream::connect(("server", PORT)).await?;
        turmoil::partition("client", "server");

        let config = ClientConfig::new("server", PORT)
            .with_groups([ECHO_PROTOCOL_NAME])
            .with_registry(cli::registry())
            .with_host(Arc::clone(&host))
            .with_handshake_timeout(Duration::from_secs(2));
        let result = Client::with_connection(Connection::new(stream, None), &config).await;

        assert!(result.is_err());
        assert_eq!(host.count_connections(), 0);
        turmoil::repair("client", "server");
        Ok(())
    });

    sim.run()
}
