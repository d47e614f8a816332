//! Chunked, pipelined message writer.

use std::{io, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use nwrc_proto::FrameHeader;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{OwnedMutexGuard, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, trace};

use crate::{
    endpoint::EndpointId,
    error::{Result, TransportError},
};

/// Bytes buffered before a chunk is handed to the writer task.
pub const CHUNK_SIZE: usize = 4096;

/// How long queued bytes may keep draining after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

enum WriteCommand {
    Chunk(Bytes),
    Flush(oneshot::Sender<io::Result<()>>),
    Shutdown,
}

/// Queue feeding a connection's writer task.
#[derive(Debug, Clone)]
pub(crate) struct FrameSink {
    commands: mpsc::UnboundedSender<WriteCommand>,
    deadline: Arc<watch::Sender<Option<Instant>>>,
}

impl FrameSink {
    /// Spawn the writer task for `writer`.
    ///
    /// The task owns `writer` and drops it when it stops, so awaiting the
    /// returned handle guarantees the write half is released.
    pub(crate) fn spawn<W>(writer: W, endpoint: EndpointId) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, queue) = mpsc::unbounded_channel();
        let (deadline, expiry) = watch::channel(None);
        let task = tokio::spawn(write_loop(writer, queue, expiry, endpoint));
        (Self { commands, deadline: Arc::new(deadline) }, task)
    }

    fn submit(&self, chunk: Bytes) -> bool {
        self.commands.send(WriteCommand::Chunk(chunk)).is_ok()
    }

    async fn flush(&self) -> io::Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands.send(WriteCommand::Flush(ack)).map_err(|_| closed())?;
        done.await.map_err(|_| closed())?
    }

    /// Flush what is queued, close the write half and stop the task.
    ///
    /// A peer that stops reading cannot hold the task past [`DRAIN_TIMEOUT`];
    /// whatever is still queued then is dropped.
    pub(crate) fn shutdown(&self) {
        self.deadline.send_if_modified(|deadline| {
            if deadline.is_some() {
                return false;
            }
            *deadline = Some(Instant::now() + DRAIN_TIMEOUT);
            true
        });
        // Fails only when the task is already gone
        let _ = self.commands.send(WriteCommand::Shutdown);
    }
}

/// Resolves once shutdown was requested and its drain deadline has passed.
async fn drain_expired(expiry: &mut watch::Receiver<Option<Instant>>) {
    let deadline = match expiry.wait_for(Option::is_some).await {
        Ok(deadline) => *deadline,
        // Every sink is gone; the closed queue ends the loop instead
        Err(_) => None,
    };
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "writer task stopped")
}

async fn write_loop<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<WriteCommand>,
    mut expiry: watch::Receiver<Option<Instant>>,
    endpoint: EndpointId,
) where
    W: AsyncWrite + Unpin,
{
    // After the first failure every later chunk is dropped and every flush
    // reports the same error kind
    let mut failure: Option<io::ErrorKind> = None;

    loop {
        let command = tokio::select! {
            command = queue.recv() => command,
            () = drain_expired(&mut expiry) => None,
        };
        let Some(command) = command else { break };

        let stop = tokio::select! {
            stop = apply(&mut writer, command, &mut failure, endpoint) => stop,
            () = drain_expired(&mut expiry) => {
                debug!(%endpoint, "peer stopped reading, dropping queued writes");
                true
            },
        };
        if stop {
            break;
        }
    }

    trace!(%endpoint, "writer task stopped");
}

/// Execute one command. Returns true once the write half is shut.
async fn apply<W>(
    writer: &mut W,
    command: WriteCommand,
    failure: &mut Option<io::ErrorKind>,
    endpoint: EndpointId,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    match command {
        WriteCommand::Chunk(chunk) => {
            if failure.is_none() {
                if let Err(error) = writer.write_all(&chunk).await {
                    debug!(%endpoint, %error, "write failed");
                    *failure = Some(error.kind());
                }
            }
            false
        },
        WriteCommand::Flush(ack) => {
            let result = match *failure {
                Some(kind) => Err(io::Error::from(kind)),
                None => writer.flush().await,
            };
            if let Err(error) = &result {
                failure.get_or_insert(error.kind());
            }
            let _ = ack.send(result);
            false
        },
        WriteCommand::Shutdown => {
            if failure.is_none() {
                if let Err(error) = writer.shutdown().await {
                    debug!(%endpoint, %error, "shutdown of write half failed");
                }
            }
            true
        },
    }
}

/// One outgoing frame.
///
/// Created by [`Endpoint::create_message`](crate::Endpoint::create_message),
/// which already queued the frame header. Holds the connection's write lock
/// until dropped.
///
/// Payload bytes accumulate into [`CHUNK_SIZE`] chunks that are queued as soon
/// as they fill. Call [`finish`](Self::finish) to wait until the whole message
/// has been written to the socket. Dropping the writer without finishing still
/// queues the remaining bytes, it just does not wait for them.
pub struct MessageWriter {
    sink: OwnedMutexGuard<FrameSink>,
    chunk: BytesMut,
    protocol_id: u32,
    broken: bool,
    finished: bool,
}

impl MessageWriter {
    pub(crate) fn begin(sink: OwnedMutexGuard<FrameSink>, protocol_id: u32) -> Self {
        let mut chunk = BytesMut::with_capacity(CHUNK_SIZE);
        chunk.extend_from_slice(&FrameHeader::new(protocol_id).to_bytes());
        Self { sink, chunk, protocol_id, broken: false, finished: false }
    }

    /// Protocol id the frame is addressed to.
    pub fn protocol_id(&self) -> u32 {
        self.protocol_id
    }

    /// Append payload bytes.
    pub fn write(&mut self, data: &[u8]) {
        if data.len() > CHUNK_SIZE {
            self.submit_chunk();
            self.submit(Bytes::copy_from_slice(data));
            return;
        }

        let room = CHUNK_SIZE - self.chunk.len();
        let (head, tail) = data.split_at(data.len().min(room));
        self.chunk.extend_from_slice(head);
        if self.chunk.len() == CHUNK_SIZE {
            self.submit_chunk();
        }
        self.chunk.extend_from_slice(tail);
    }

    /// Append a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.write(&value.to_be_bytes());
    }

    /// Queue the remaining bytes and wait until the whole message is flushed.
    pub async fn finish(mut self) -> Result<()> {
        self.submit_chunk();
        self.finished = true;
        if self.broken {
            return Err(TransportError::ConnectionClosed);
        }
        self.sink.flush().await.map_err(|error| match error.kind() {
            io::ErrorKind::BrokenPipe => TransportError::ConnectionClosed,
            _ => TransportError::Io(error),
        })
    }

    fn submit_chunk(&mut self) {
        if self.chunk.is_empty() {
            return;
        }
        let chunk = std::mem::replace(&mut self.chunk, BytesMut::with_capacity(CHUNK_SIZE));
        self.submit(chunk.freeze());
    }

    fn submit(&mut self, bytes: Bytes) {
        if !self.broken && !self.sink.submit(bytes) {
            self.broken = true;
        }
    }
}

impl io::Write for MessageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        MessageWriter::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.submit_chunk();
        }
    }
}
