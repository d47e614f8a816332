//! One live connection and its dispatch loop.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────┐  registered   ┌────────┐  close / EOF / fatal error  ┌─────────┐
//! │ Starting │──────────────>│ Active │────────────────────────────>│ Closing │
//! └──────────┘               └────────┘                             └─────────┘
//!      │                                                                 │
//!      │ handshake failure                                    loop exit  │
//!      └────────────────────────────>┌────────┐<───────────────────────────┘
//!                                    │ Closed │
//!                                    └────────┘
//! ```
//!
//! Server endpoints are registered (and become Active) as soon as they are
//! accepted. Client endpoints stay Starting until negotiation succeeds, so a
//! half-negotiated connection is never counted as live.
//!
//! # Dispatch
//!
//! A single task per endpoint reads frame headers and runs the handler bound
//! to each frame's protocol id. Handlers run one at a time, in arrival order.
//! Fatal errors (bad magic, unknown id, I/O failure) end the loop; handler
//! failures are logged and the next frame is read.
//!
//! [`Endpoint::invalidate`] interrupts whatever the loop is waiting on, be it
//! a header, a partial payload or a handler. The stream is discarded on close,
//! so abandoning a half-read frame is harmless.
//!
//! A supervisor task waits for the loop to exit, normally or by panic, and
//! then tears the endpoint down: sessions this endpoint allocated are
//! cancelled, the writer task is stopped (which drops the last half of the
//! stream) and the host's live count is released. Only then does the endpoint
//! report Closed.

use std::{
    collections::HashSet,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use nwrc_proto::ProtocolTable;
use tokio::{
    io::AsyncRead,
    sync::{Notify, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    connection::Connection,
    error::{NegotiationError, Result, TransportError},
    framing::{FrameReader, FrameSink, MessageWriter, Request},
    host::ConnectionHost,
    lock,
    protocol::{ProtocolList, SELF_DELIMITING},
    reply::{Reply, ReplyFuture, SessionTable},
};

/// Attempts to match a Reply against a session that may still be registering.
const REPLY_LOOKUP_ATTEMPTS: usize = 3;

/// Process-unique endpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// Endpoint lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Stream bound, not yet registered with a host
    Starting,
    /// Registered and counted as live
    Active,
    /// Close requested, dispatch loop winding down
    Closing,
    /// Loop exited and resources released
    Closed,
}

#[derive(Debug, Default)]
struct Lifecycle {
    registered: bool,
    torn_down: bool,
}

struct Inner {
    id: EndpointId,
    peer: Option<SocketAddr>,
    secure: bool,
    valid: AtomicBool,
    // Mirrors `Lifecycle::registered` for lock-free reads
    counted: AtomicBool,
    state: watch::Sender<EndpointState>,
    shutdown: Notify,
    // Holding this lock is what makes a MessageWriter exclusive
    writer: Arc<tokio::sync::Mutex<FrameSink>>,
    sink: FrameSink,
    protocols: tokio::sync::Mutex<ProtocolList>,
    table: Mutex<ProtocolTable>,
    sessions: Arc<SessionTable>,
    owned_sessions: Mutex<HashSet<u32>>,
    lifecycle: Mutex<Lifecycle>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one live connection. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Bind `connection` to `protocols` and start the dispatch loop.
    ///
    /// The endpoint starts in [`EndpointState::Starting`]; the host moves it
    /// to Active when registering it.
    pub(crate) fn spawn(
        connection: Connection,
        protocols: ProtocolList,
        sessions: Arc<SessionTable>,
        host: Arc<ConnectionHost>,
    ) -> Self {
        let id = EndpointId::next();
        let (stream, peer, secure) = connection.into_parts();
        let (read_half, write_half) = tokio::io::split(stream);

        let (sink, writer_task) = FrameSink::spawn(write_half, id);
        let (state, _) = watch::channel(EndpointState::Starting);
        let table = protocols.table();

        let endpoint = Self {
            inner: Arc::new(Inner {
                id,
                peer,
                secure,
                valid: AtomicBool::new(true),
                counted: AtomicBool::new(false),
                state,
                shutdown: Notify::new(),
                writer: Arc::new(tokio::sync::Mutex::new(sink.clone())),
                sink,
                protocols: tokio::sync::Mutex::new(protocols),
                table: Mutex::new(table),
                sessions,
                owned_sessions: Mutex::new(HashSet::new()),
                lifecycle: Mutex::new(Lifecycle::default()),
                writer_task: Mutex::new(Some(writer_task)),
            }),
        };

        let task = tokio::spawn(run(endpoint.clone(), FrameReader::new(read_half)));
        let supervised = endpoint.clone();
        tokio::spawn(async move {
            if let Err(join_error) = task.await {
                if join_error.is_panic() {
                    error!(endpoint = %supervised.id(), "dispatch loop panicked");
                }
            }
            supervised.teardown(&host).await;
        });

        debug!(endpoint = %id, ?peer, secure, "endpoint started");
        endpoint
    }

    /// Identifier used in logs and events.
    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    /// Remote address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Whether the stream is wrapped in TLS.
    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    /// Whether the endpoint still accepts work.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EndpointState {
        *self.inner.state.borrow()
    }

    /// Session table Reply frames are matched against.
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.inner.sessions
    }

    /// Current `name -> id` assignment.
    pub fn protocol_table(&self) -> ProtocolTable {
        lock(&self.inner.table).clone()
    }

    /// Wire id of the protocol named `name`.
    pub fn protocol_id(&self, name: &str) -> Option<u32> {
        lock(&self.inner.table).id_of(name)
    }

    /// Start an outgoing frame to `protocol_id`.
    ///
    /// Waits for the connection's write lock, which is held until the
    /// returned writer is finished or dropped.
    pub async fn create_message(&self, protocol_id: u32) -> Result<MessageWriter> {
        if !self.is_valid() {
            return Err(TransportError::ConnectionClosed);
        }
        let guard = Arc::clone(&self.inner.writer).lock_owned().await;
        Ok(MessageWriter::begin(guard, protocol_id))
    }

    /// Reserve a Reply session owned by this endpoint.
    ///
    /// If the endpoint closes before the Reply arrives, the future resolves to
    /// [`ReplyError::Cancelled`](crate::ReplyError::Cancelled).
    pub fn alloc_session(&self) -> (u32, ReplyFuture) {
        let (session_id, reply) = self.inner.sessions.alloc();
        let mut owned = lock(&self.inner.owned_sessions);
        if self.is_valid() {
            owned.insert(session_id);
        } else {
            self.inner.sessions.cancel(session_id);
        }
        (session_id, reply)
    }

    /// Answer `session_id` through the Reply protocol.
    pub async fn send_reply(&self, session_id: u32, payload: &[u8]) -> Result<()> {
        Reply::send(self, session_id, payload).await
    }

    /// Stop the dispatch loop, abandoning any frame it is in the middle of.
    ///
    /// Does not wait; see [`close`](Self::close).
    pub fn invalidate(&self) {
        self.request_close();
        self.inner.shutdown.notify_one();
    }

    /// Mark the endpoint Closing without interrupting the running handler.
    /// The loop exits once the current frame is done.
    pub(crate) fn request_close(&self) {
        if self.inner.valid.swap(false, Ordering::AcqRel) {
            self.inner.state.send_if_modified(|state| match state {
                EndpointState::Starting | EndpointState::Active => {
                    *state = EndpointState::Closing;
                    true
                },
                EndpointState::Closing | EndpointState::Closed => false,
            });
            debug!(endpoint = %self.inner.id, "close requested");
        }
    }

    /// Close the connection and wait until its resources are released.
    pub async fn close(&self) {
        self.invalidate();
        self.wait_closed().await;
    }

    /// Wait until the endpoint reaches [`EndpointState::Closed`].
    pub async fn wait_closed(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = state.wait_for(|state| *state == EndpointState::Closed).await;
    }

    /// Apply the server's table to the local protocol list.
    pub(crate) async fn install_table(
        &self,
        table: &ProtocolTable,
        handshake_name: &str,
    ) -> std::result::Result<(), NegotiationError> {
        ProtocolList::check_bootstrap(table, handshake_name)?;

        let mut protocols = self.inner.protocols.lock().await;
        protocols.reorder(table)?;
        *lock(&self.inner.table) = protocols.table();
        Ok(())
    }

    /// Move Starting to Active. Returns whether the state changed.
    pub(crate) fn activate(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == EndpointState::Starting {
                *state = EndpointState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Run `register` under the lifecycle lock unless the endpoint is already
    /// registered or torn down.
    pub(crate) fn mark_registered(&self, register: impl FnOnce()) -> bool {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if lifecycle.registered || lifecycle.torn_down {
            return false;
        }
        lifecycle.registered = true;
        self.inner.counted.store(true, Ordering::Release);
        register();
        true
    }

    /// Whether the host's live count still includes this endpoint.
    pub(crate) fn is_counted(&self) -> bool {
        self.inner.counted.load(Ordering::Acquire)
    }

    pub(crate) async fn deliver_reply(&self, session_id: u32, payload: Bytes) {
        lock(&self.inner.owned_sessions).remove(&session_id);

        for attempt in 1..=REPLY_LOOKUP_ATTEMPTS {
            match self.inner.sessions.fulfill(session_id, payload.clone()) {
                Ok(()) => return,
                Err(_) if attempt < REPLY_LOOKUP_ATTEMPTS => tokio::task::yield_now().await,
                Err(error) => {
                    warn!(endpoint = %self.inner.id, session_id, %error, "dropping reply");
                },
            }
        }
    }

    /// Read and handle one frame. `Ok(false)` means the peer closed the
    /// stream between frames.
    async fn next_frame<R>(&self, reader: &mut FrameReader<R>) -> Result<bool>
    where
        R: AsyncRead + Unpin + Send,
    {
        let Some(protocol_id) = reader.next_frame().await? else {
            return Ok(false);
        };
        self.dispatch(reader, protocol_id).await?;
        Ok(true)
    }

    async fn dispatch<R>(&self, reader: &mut FrameReader<R>, protocol_id: u32) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut protocols = self.inner.protocols.lock().await;
        let count = protocols.len();
        let protocol = protocols
            .get_mut(protocol_id)
            .ok_or(TransportError::UnknownProtocolId { id: protocol_id, count })?;

        let expected = protocol.expected_length();
        if expected == SELF_DELIMITING {
            let mut request = Request::new(protocol_id, reader.stream(), self, false);
            return protocol.handle(&mut request).await;
        }

        let mut body: &[u8] = reader.load(expected).await?;
        let mut request = Request::new(protocol_id, &mut body, self, true);
        // The stream is already past this frame, so nothing a fixed-length
        // handler does can desynchronize it
        if let Err(error) = protocol.handle(&mut request).await {
            warn!(
                endpoint = %self.inner.id,
                protocol = protocol.name(),
                %error,
                "handler failed"
            );
        }
        Ok(())
    }

    async fn teardown(&self, host: &ConnectionHost) {
        let inner = &self.inner;
        inner.valid.store(false, Ordering::Release);

        let owned: Vec<u32> = lock(&inner.owned_sessions).drain().collect();
        let cancelled = owned.into_iter().filter(|id| inner.sessions.cancel(*id)).count();

        inner.sink.shutdown();
        let writer_task = lock(&inner.writer_task).take();
        if let Some(task) = writer_task {
            if let Err(error) = task.await {
                warn!(endpoint = %inner.id, %error, "writer task ended abnormally");
            }
        }

        let registered = {
            let mut lifecycle = lock(&inner.lifecycle);
            lifecycle.torn_down = true;
            self.inner.counted.store(false, Ordering::Release);
            std::mem::take(&mut lifecycle.registered)
        };
        if registered {
            host.release(self);
        }

        inner.state.send_replace(EndpointState::Closed);
        info!(endpoint = %inner.id, peer = ?inner.peer, cancelled, "connection closed");
    }
}

async fn run<R>(endpoint: Endpoint, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin + Send,
{
    let id = endpoint.id();

    while endpoint.is_valid() {
        let outcome = tokio::select! {
            biased;
            () = endpoint.inner.shutdown.notified() => break,
            outcome = endpoint.next_frame(&mut reader) => outcome,
        };

        let error = match outcome {
            Ok(true) => continue,
            Ok(false) => {
                debug!(endpoint = %id, "peer closed the stream");
                break;
            },
            Err(error) => error,
        };
        if !endpoint.is_valid() {
            break;
        }
        if error.is_disconnect() {
            debug!(endpoint = %id, %error, "peer disconnected");
            break;
        }
        if error.is_fatal() {
            warn!(endpoint = %id, %error, "closing connection");
            break;
        }
        warn!(endpoint = %id, %error, "frame handling failed");
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
