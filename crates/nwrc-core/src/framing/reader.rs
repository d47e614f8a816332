//! Frame header parsing and per-frame payload access.

use std::io;

use bytes::{Bytes, BytesMut};
use nwrc_proto::FrameHeader;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::{
    endpoint::Endpoint,
    error::{Result, TransportError},
};

/// Reusable staging area for fixed-length payloads.
///
/// Starts at [`INITIAL_CAPACITY`](Self::INITIAL_CAPACITY) bytes and grows to
/// the next power of two whenever a payload does not fit. It never shrinks.
#[derive(Debug)]
pub struct ReceiveBuffer {
    storage: Vec<u8>,
}

impl ReceiveBuffer {
    /// Size of a freshly created buffer.
    pub const INITIAL_CAPACITY: usize = 8192;

    /// Create a buffer with the initial capacity.
    pub fn new() -> Self {
        Self { storage: vec![0; Self::INITIAL_CAPACITY] }
    }

    /// Bytes currently available without growing.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Make room for `len` bytes.
    pub fn ensure(&mut self, len: usize) {
        if len > self.storage.len() {
            self.storage.resize(len.next_power_of_two(), 0);
        }
    }

    /// Read exactly `len` bytes from `reader` and return them.
    pub async fn fill<R>(&mut self, reader: &mut R, len: usize) -> io::Result<&[u8]>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.ensure(len);
        reader.read_exact(&mut self.storage[..len]).await?;
        Ok(&self.storage[..len])
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a connection.
pub(crate) struct FrameReader<R> {
    stream: BufReader<R>,
    buffer: ReceiveBuffer,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub(crate) fn new(reader: R) -> Self {
        Self { stream: BufReader::new(reader), buffer: ReceiveBuffer::new() }
    }

    /// Read the next frame header and return its protocol id.
    ///
    /// The magic marker is validated before the id is read. Returns `None` when
    /// the peer closed the stream between frames.
    pub(crate) async fn next_frame(&mut self) -> Result<Option<u32>> {
        let mut magic = [0u8; FrameHeader::MAGIC_SIZE];
        match self.stream.read_exact(&mut magic).await {
            Ok(_) => {},
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        FrameHeader::check_magic(magic)?;

        Ok(Some(self.stream.read_u32().await?))
    }

    /// Stage a fixed-length payload.
    pub(crate) async fn load(&mut self, len: usize) -> Result<&[u8]> {
        Ok(self.buffer.fill(&mut self.stream, len).await?)
    }

    /// Raw stream for self-delimiting payloads.
    pub(crate) fn stream(&mut self) -> &mut BufReader<R> {
        &mut self.stream
    }
}

/// One inbound frame as seen by a protocol handler.
///
/// For fixed-length protocols the body is the staged payload: reading past it
/// fails with `UnexpectedEof` and leaving bytes unread is harmless. For
/// self-delimiting protocols the body is the connection stream itself and the
/// handler must consume exactly its payload.
pub struct Request<'a> {
    protocol_id: u32,
    body: &'a mut (dyn AsyncRead + Unpin + Send),
    endpoint: &'a Endpoint,
    buffered: bool,
}

impl<'a> Request<'a> {
    pub(crate) fn new(
        protocol_id: u32,
        body: &'a mut (dyn AsyncRead + Unpin + Send),
        endpoint: &'a Endpoint,
        buffered: bool,
    ) -> Self {
        Self { protocol_id, body, endpoint, buffered }
    }

    /// Id the frame was addressed to.
    pub fn protocol_id(&self) -> u32 {
        self.protocol_id
    }

    /// Endpoint the frame arrived on, for sending responses.
    pub fn endpoint(&self) -> &Endpoint {
        self.endpoint
    }

    /// Whether the body is a staged fixed-length payload.
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Read a big-endian `u32`.
    pub async fn read_u32(&mut self) -> Result<u32> {
        Ok(self.body.read_u32().await?)
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.body.read_exact(buf).await?;
        Ok(())
    }

    /// Read `len` bytes into an owned buffer.
    pub async fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        self.body.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }

    /// Read whatever remains of a staged payload.
    pub async fn read_remaining(&mut self) -> Result<Bytes> {
        if !self.buffered {
            return Err(TransportError::Config(
                "read_remaining needs a fixed-length protocol".to_string(),
            ));
        }
        let mut buf = Vec::new();
        self.body.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Ask the endpoint to close once this handler returns.
    pub fn close_connection(&self) {
        self.endpoint.request_close();
    }
}
