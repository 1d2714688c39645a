//! Per-channel plumbing: the handle other components use to reach a client,
//! the frame reader, and the writer task that drains the handle's queue.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use fleetsync_shared::{
    codec::{self, FrameDecoder},
    Envelope,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::auth::Principal;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier; never reused after close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a frame was not queued for a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The client is not draining its queue fast enough
    QueueFull,
    /// The connection's writer is gone
    Closed,
}

/// Reference to one open channel
///
/// Cloning is cheap; all clones feed the same outbound queue. Two handles are
/// equal only if they refer to the same connection.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ConnectionId,
    addr: SocketAddr,
    principal: Principal,
    outbound: mpsc::Sender<Bytes>,
}

impl ChannelHandle {
    /// Create a handle and the receiving end of its outbound queue
    pub fn new(addr: SocketAddr, principal: Principal, queue_depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(queue_depth.max(1));
        let handle = Self {
            id: ConnectionId::next(),
            addr,
            principal,
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Queue an already-encoded frame without waiting
    pub fn try_deliver(&self, frame: Bytes) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Encode and queue one envelope for this connection only
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = codec::encode(envelope)?;
        self.try_deliver(frame)
            .map_err(|e| anyhow!("{} not accepting frames: {:?}", self.id, e))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChannelHandle {}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("principal", &self.principal.id)
            .finish()
    }
}

/// Reads whole envelopes off the inbound half of a channel
pub struct ChannelReader<R> {
    reader: R,
    addr: SocketAddr,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ChannelReader<R> {
    pub fn new(reader: R, addr: SocketAddr) -> Self {
        Self {
            reader,
            addr,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Read the next envelope
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly and an
    /// error for undecodable frames or I/O failures.
    pub async fn recv(&mut self) -> Result<Option<Envelope>> {
        loop {
            if let Some(envelope) = self.decoder.decode_next()? {
                return Ok(Some(envelope));
            }

            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                if self.decoder.has_partial_frame() {
                    debug!("{} closed mid-frame", self.addr);
                }
                return Ok(None);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }
}

/// Spawn the task that writes queued frames to the socket
///
/// The task ends when every handle clone is dropped or a write fails.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, id: ConnectionId) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!("{} write failed: {}", id, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_shared::{envelope::Payload, Ping, Role};

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().expect("addr")
    }

    #[test]
    fn test_handles_compare_by_connection() {
        let principal = Principal::new("op-1", Role::Operator);
        let (a, _rx_a) = ChannelHandle::new(addr(), principal.clone(), 4);
        let (b, _rx_b) = ChannelHandle::new(addr(), principal, 4);

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_full_and_closed_queues_report_without_blocking() {
        let (handle, rx) = ChannelHandle::new(addr(), Principal::new("v", Role::Viewer), 1);

        assert_eq!(handle.try_deliver(Bytes::from_static(b"1")), Ok(()));
        assert_eq!(
            handle.try_deliver(Bytes::from_static(b"2")),
            Err(DeliveryError::QueueFull)
        );

        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(
            handle.try_deliver(Bytes::from_static(b"3")),
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn test_writer_and_reader_share_framing() {
        let (client, server) = tokio::io::duplex(1024);
        let (handle, rx) = ChannelHandle::new(addr(), Principal::new("d", Role::Device), 8);
        let writer = spawn_writer(server, rx, handle.id());

        handle
            .send(&Envelope::new("server", 1, Payload::Ping(Ping { nonce: 41 })))
            .expect("queue");
        handle
            .send(&Envelope::new("server", 2, Payload::Ping(Ping { nonce: 42 })))
            .expect("queue");
        drop(handle);

        let mut reader = ChannelReader::new(client, addr());
        let mut nonces = Vec::new();
        while let Some(envelope) = reader.recv().await.expect("read") {
            if let Some(Payload::Ping(ping)) = envelope.payload {
                nonces.push(ping.nonce);
            }
        }
        assert_eq!(nonces, vec![41, 42]);
        writer.await.expect("writer");
    }
}
