//! Accepting side.
//!
//! [`Server::start`] resolves the configured protocol groups once, derives the
//! authoritative protocol table from their order and starts an accept loop.
//! Every accepted connection is set up on its own task, so a slow TLS
//! handshake never holds up the listener. Failures during setup are logged,
//! published as [`ConnectionEvent::AcceptFailed`] and otherwise swallowed.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use nwrc_proto::ProtocolTable;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Notify,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection::Connection,
    endpoint::Endpoint,
    error::Result,
    handshake::HandshakeGroup,
    host::{AcceptStage, ConnectionEvent, ConnectionHost},
    lock,
    protocol::{Protocol, ProtocolList},
    registry::{ProtocolGroup, ProtocolRegistry},
    tls::{self, TlsServerOptions},
};

/// Server-side protocol template.
///
/// Instantiates a fresh [`ProtocolList`] per accepted connection, always in
/// the same order, so every client sees the same table.
pub struct ServerProtocols {
    handshake: Arc<dyn HandshakeGroup>,
    groups: Vec<Arc<dyn ProtocolGroup>>,
    table: Arc<ProtocolTable>,
}

impl ServerProtocols {
    /// Resolve `group_names` and compute the table.
    pub fn new(
        registry: &ProtocolRegistry,
        handshake: Arc<dyn HandshakeGroup>,
        group_names: &[String],
    ) -> Result<Self> {
        let groups = registry.resolve(group_names)?;

        let template = ProtocolList::bootstrap(
            handshake.server_side(Arc::new(ProtocolTable::new())),
            groups.iter().map(|group| group.server_side()),
        );
        template.check_unique()?;
        let table = template.table();
        ProtocolList::check_bootstrap(&table, handshake.name())?;

        Ok(Self { handshake, groups, table: Arc::new(table) })
    }

    /// Table every client will be sent.
    pub fn table(&self) -> &ProtocolTable {
        &self.table
    }

    /// Fresh instances for one connection.
    pub fn instantiate(&self) -> ProtocolList {
        let rest: Vec<Box<dyn Protocol>> =
            self.groups.iter().map(|group| group.server_side()).collect();
        ProtocolList::bootstrap(self.handshake.server_side(Arc::clone(&self.table)), rest)
    }
}

/// Entry point for listening.
#[derive(Debug)]
pub struct Server;

impl Server {
    /// Bind the listener and start accepting.
    pub async fn start(config: ServerConfig) -> Result<RunningServer> {
        let protocols = ServerProtocols::new(
            &config.registry,
            Arc::clone(&config.handshake),
            &config.protocol_groups,
        )?;
        let listener = TcpListener::bind((config.bind, config.port)).await?;
        let local_addr = listener.local_addr()?;

        let names: Vec<&str> =
            protocols.table().entries().iter().map(|entry| entry.name.as_str()).collect();
        info!(%local_addr, protocols = ?names, tls = config.tls.is_some(), "server listening");

        let table = protocols.table().clone();
        let accept = AcceptContext {
            protocols: Arc::new(protocols),
            tls: config.tls.map(Arc::new),
            host: config.host,
            accepted: Arc::new(Mutex::new(Vec::new())),
        };
        let shutdown = Arc::new(Notify::new());
        let accepted = Arc::clone(&accept.accepted);
        let task = tokio::spawn(accept_loop(listener, accept, Arc::clone(&shutdown)));

        Ok(RunningServer { local_addr, table, shutdown, accepted, task: Some(task) })
    }
}

/// Handle to a listening server.
///
/// Dropping it stops the accept loop but leaves accepted connections running;
/// [`shutdown`](Self::shutdown) closes those too.
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    table: ProtocolTable,
    shutdown: Arc<Notify>,
    accepted: Arc<Mutex<Vec<Endpoint>>>,
    task: Option<JoinHandle<()>>,
}

impl RunningServer {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Table sent to every client.
    pub fn protocol_table(&self) -> &ProtocolTable {
        &self.table
    }

    /// Endpoints accepted by this server that are still open.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        lock(&self.accepted).iter().filter(|endpoint| endpoint.is_valid()).cloned().collect()
    }

    /// Stop accepting, close every accepted endpoint and wait for cleanup.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "accept loop ended abnormally");
            }
        }

        let endpoints: Vec<Endpoint> = std::mem::take(&mut *lock(&self.accepted));
        for endpoint in &endpoints {
            endpoint.close().await;
        }
        info!(local_addr = %self.local_addr, closed = endpoints.len(), "server stopped");
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

#[derive(Clone)]
struct AcceptContext {
    protocols: Arc<ServerProtocols>,
    tls: Option<Arc<TlsServerOptions>>,
    host: Arc<ConnectionHost>,
    accepted: Arc<Mutex<Vec<Endpoint>>>,
}

async fn accept_loop(listener: TcpListener, context: AcceptContext, shutdown: Arc<Notify>) {
    loop {
        let (tcp, peer) = tokio::select! {
            biased;
            () = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(error) => {
                    debug!(%error, "accept failed");
                    context.host.emit(ConnectionEvent::AcceptFailed {
                        peer: None,
                        stage: AcceptStage::Tcp,
                        reason: error.to_string(),
                    });
                    continue;
                },
            },
        };

        tokio::spawn(enable_client(tcp, peer, context.clone()));
    }
    debug!("accept loop stopped");
}

async fn enable_client(tcp: TcpStream, peer: SocketAddr, context: AcceptContext) {
    let connection = match context.tls.as_deref() {
        Some(options) => match tls::accept(tcp, options).await {
            Ok(connection) => connection,
            Err(error) => {
                debug!(%peer, %error, "TLS accept failed");
                context.host.emit(ConnectionEvent::AcceptFailed {
                    peer: Some(peer),
                    stage: AcceptStage::Tls,
                    reason: error.to_string(),
                });
                return;
            },
        },
        None => Connection::plain(tcp),
    };

    let endpoint = context.host.add(connection, context.protocols.instantiate());

    let mut accepted = lock(&context.accepted);
    accepted.retain(Endpoint::is_valid);
    accepted.push(endpoint);
}
