//! Request/response correlation.
//!
//! A caller that expects an answer allocates a session from a
//! [`SessionTable`] and embeds the session id in its request. The peer
//! answers through the Reply protocol (wire id 0):
//!
//! ```text
//! SessionId (u32 BE) | Length (u32 BE) | Bytes[Length]
//! ```
//!
//! The Reply handler on the requesting side completes the matching
//! [`ReplyFuture`] and the id goes back into the free pool.
//!
//! # Session lifecycle
//!
//! ```text
//! ┌──────┐  alloc   ┌─────────┐  fulfill / cancel  ┌──────┐
//! │ Free │─────────>│ Pending │───────────────────>│ Free │
//! └──────┘          └─────────┘                    └──────┘
//! ```
//!
//! An id is never pending twice at once. Ids leave the free pool only through
//! `alloc` and re-enter it only when their entry is removed.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::Bytes;
use nwrc_proto::{
    MAX_PAYLOAD_SIZE, ProtocolError, REPLY_PROTOCOL_ID, REPLY_PROTOCOL_NAME, ReplyHeader,
};
use tokio::sync::oneshot;

use crate::{
    endpoint::Endpoint,
    error::{ReplyError, Result},
    framing::Request,
    protocol::{Protocol, SELF_DELIMITING},
};

#[derive(Default)]
struct Sessions {
    next_id: u32,
    free: VecDeque<u32>,
    pending: HashMap<u32, oneshot::Sender<Bytes>>,
}

/// Pending request sessions awaiting a Reply.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<Sessions>,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide table.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<SessionTable>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a session id and return the future its Reply will complete.
    ///
    /// Freed ids are reused before new ones are minted.
    pub fn alloc(&self) -> (u32, ReplyFuture) {
        let mut sessions = self.lock();
        let id = match sessions.free.pop_front() {
            Some(id) => id,
            None => loop {
                let candidate = sessions.next_id;
                sessions.next_id = sessions.next_id.wrapping_add(1);
                // Only matters after the counter wraps
                if !sessions.pending.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let (sender, receiver) = oneshot::channel();
        sessions.pending.insert(id, sender);
        (id, ReplyFuture { session_id: id, receiver })
    }

    /// Complete session `id` with `payload` and free the id.
    pub fn fulfill(&self, id: u32, payload: Bytes) -> std::result::Result<(), ReplyError> {
        let sender = {
            let mut sessions = self.lock();
            let sender = sessions.pending.remove(&id).ok_or(ReplyError::UnknownSession(id))?;
            sessions.free.push_back(id);
            sender
        };
        // The waiter may have given up; the id is free either way
        let _ = sender.send(payload);
        Ok(())
    }

    /// Drop session `id` without a payload. Its future resolves to
    /// [`ReplyError::Cancelled`].
    pub fn cancel(&self, id: u32) -> bool {
        let mut sessions = self.lock();
        if sessions.pending.remove(&id).is_some() {
            sessions.free.push_back(id);
            true
        } else {
            false
        }
    }

    /// Whether `id` is awaiting a Reply.
    pub fn is_pending(&self, id: u32) -> bool {
        self.lock().pending.contains_key(&id)
    }

    /// Number of sessions awaiting a Reply.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self.lock();
        f.debug_struct("SessionTable")
            .field("pending", &sessions.pending.len())
            .field("free", &sessions.free.len())
            .finish()
    }
}

/// Resolves to the Reply payload of one session.
#[derive(Debug)]
pub struct ReplyFuture {
    session_id: u32,
    receiver: oneshot::Receiver<Bytes>,
}

impl ReplyFuture {
    /// Session this future waits on.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }
}

impl Future for ReplyFuture {
    type Output = std::result::Result<Bytes, ReplyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| result.map_err(|_| ReplyError::Cancelled))
    }
}

/// The Reply protocol, permanently bound at id 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reply;

impl Reply {
    /// Answer session `session_id` on `endpoint` with `payload`.
    pub async fn send(endpoint: &Endpoint, session_id: u32, payload: &[u8]) -> Result<()> {
        let length = u32::try_from(payload.len())
            .ok()
            .filter(|length| *length <= MAX_PAYLOAD_SIZE)
            .ok_or(ProtocolError::PayloadTooLarge {
                size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            })?;

        let mut message = endpoint.create_message(REPLY_PROTOCOL_ID).await?;
        message.write(&ReplyHeader::new(session_id, length).to_bytes());
        message.write(payload);
        message.finish().await
    }
}

#[async_trait]
impl Protocol for Reply {
    fn name(&self) -> &str {
        REPLY_PROTOCOL_NAME
    }

    fn expected_length(&self) -> usize {
        SELF_DELIMITING
    }

    async fn handle(&mut self, request: &mut Request<'_>) -> Result<()> {
        let mut raw = [0u8; ReplyHeader::SIZE];
        request.read_exact(&mut raw).await?;
        let header = ReplyHeader::from_bytes(&raw)?;

        let payload = request.read_bytes(header.length() as usize).await?;
        request.endpoint().deliver_reply(header.session_id(), payload).await;
        Ok(())
    }
}
