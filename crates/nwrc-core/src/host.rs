//! Registry of live endpoints.
//!
//! The host owns every registered endpoint and keeps an exact count of the
//! live ones. Closed endpoints linger in the registry until the live share
//! drops below [`ConnectionHost::COMPACTION_THRESHOLD`], at which point the
//! registry is swept. This keeps closing cheap while bounding growth to
//! roughly four times the peak live count.
//!
//! Lifecycle changes are published as [`ConnectionEvent`]s to anyone who
//! [subscribed](ConnectionHost::subscribe).

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    connection::Connection,
    endpoint::{Endpoint, EndpointId},
    lock,
    protocol::ProtocolList,
    reply::SessionTable,
};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Step at which an inbound connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStage {
    /// Accepting the TCP connection
    Tcp,
    /// Server-side TLS handshake
    Tls,
}

/// Connection lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Endpoint registered and counted as live
    Connected {
        /// Endpoint identifier
        endpoint: EndpointId,
        /// Remote address, when known
        peer: Option<SocketAddr>,
    },
    /// Registered endpoint closed
    Disconnected {
        /// Endpoint identifier
        endpoint: EndpointId,
        /// Remote address, when known
        peer: Option<SocketAddr>,
    },
    /// Inbound connection dropped before an endpoint existed
    AcceptFailed {
        /// Remote address, when known
        peer: Option<SocketAddr>,
        /// Step that failed
        stage: AcceptStage,
        /// Failure description
        reason: String,
    },
}

/// Owner of every registered endpoint.
pub struct ConnectionHost {
    endpoints: Mutex<Vec<Endpoint>>,
    live: AtomicUsize,
    sessions: Arc<SessionTable>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionHost {
    /// Live share of the registry below which it is swept.
    pub const COMPACTION_THRESHOLD: f64 = 0.25;

    /// Create a host with its own session table.
    pub fn new() -> Self {
        Self::with_sessions(Arc::new(SessionTable::new()))
    }

    /// Create a host matching Replies against `sessions`.
    pub fn with_sessions(sessions: Arc<SessionTable>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { endpoints: Mutex::new(Vec::new()), live: AtomicUsize::new(0), sessions, events }
    }

    /// Process-wide host, sharing the process-wide session table.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ConnectionHost>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::with_sessions(SessionTable::global()))))
    }

    /// Session table shared by this host's endpoints.
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Bind `connection` to `protocols`, register it and start dispatching.
    pub fn add(self: &Arc<Self>, connection: Connection, protocols: ProtocolList) -> Endpoint {
        let endpoint = self.start(connection, protocols);
        self.register(&endpoint);
        endpoint
    }

    /// Bind and start dispatching without registering.
    ///
    /// The endpoint stays Starting and is not counted until
    /// [`register`](Self::register) is called.
    pub fn start(self: &Arc<Self>, connection: Connection, protocols: ProtocolList) -> Endpoint {
        Endpoint::spawn(connection, protocols, Arc::clone(&self.sessions), Arc::clone(self))
    }

    /// Count `endpoint` as live and make it Active.
    ///
    /// Returns false if it was already registered or has already closed.
    pub fn register(&self, endpoint: &Endpoint) -> bool {
        let mut live = 0;
        let registered = endpoint.mark_registered(|| {
            lock(&self.endpoints).push(endpoint.clone());
            live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        });
        if !registered {
            return false;
        }

        endpoint.activate();
        info!(endpoint = %endpoint.id(), peer = ?endpoint.peer_addr(), live, "connection registered");
        self.emit(ConnectionEvent::Connected {
            endpoint: endpoint.id(),
            peer: endpoint.peer_addr(),
        });
        true
    }

    /// Called once per registered endpoint when it closes.
    pub(crate) fn release(&self, endpoint: &Endpoint) {
        let live = self.live.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.emit(ConnectionEvent::Disconnected {
            endpoint: endpoint.id(),
            peer: endpoint.peer_addr(),
        });
        self.compact_if_sparse(live);
    }

    fn compact_if_sparse(&self, live: usize) {
        let mut endpoints = lock(&self.endpoints);
        if endpoints.is_empty() {
            return;
        }

        let utilization = live as f64 / endpoints.len() as f64;
        if utilization < Self::COMPACTION_THRESHOLD {
            let before = endpoints.len();
            // Keep everything still counted so live never exceeds the registry
            endpoints.retain(Endpoint::is_counted);
            debug!(before, after = endpoints.len(), live, "registry compacted");
        }
    }

    /// Number of registered endpoints that have not closed.
    pub fn count_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Registry size including closed endpoints not yet swept.
    pub fn registry_len(&self) -> usize {
        lock(&self.endpoints).len()
    }

    /// Snapshot of registered endpoints that are still valid.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        lock(&self.endpoints).iter().filter(|endpoint| endpoint.is_valid()).cloned().collect()
    }

    /// Close every registered endpoint and wait for each to finish.
    pub async fn close_all(&self) {
        for endpoint in self.endpoints() {
            endpoint.close().await;
        }
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for ConnectionHost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHost")
            .field("live", &self.count_connections())
            .field("registry", &self.registry_len())
            .finish_non_exhaustive()
    }
}
