//! The TCP stream owned by a connection handle.
//!
//! A connected stream is split in two. The read half lives in a slot
//! together with the fixed inbound chunk and is only touched by the
//! receive engine, one read at a time. The write half is moved into a
//! writer task that drains a channel, so writes hit the wire in the order
//! `send` was called. Both sides watch one cancellation token: closing the
//! socket wakes whatever is pending and makes later operations fail fast.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{ConnectionId, NetConfig, NetError};

/// Read half plus the chunk it reads into. Allocated once, never resized.
struct ReadSlot {
    half: OwnedReadHalf,
    chunk: Box<[u8]>,
}

/// One queued write for the writer task.
struct WriteOp {
    bytes: Vec<u8>,
    close_after: bool,
}

/// State shared between [`Socket`] clones and the writer task.
struct Shared {
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: CancellationToken,
    close_once: AtomicBool,
    reader: Mutex<Option<ReadSlot>>,
}

impl Shared {
    fn close(&self) {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        // A pending read holds the lock; it drops the half itself once it
        // observes the cancellation.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        debug!(id = %self.id, peer = %self.peer_addr, "socket closed");
    }
}

/// A connected TCP stream, exclusively owned by one
/// [`ConnectionHandle`](crate::ConnectionHandle).
///
/// Cloning is cheap and every clone refers to the same stream. The stream
/// is closed exactly once, by whichever of [`close`](Self::close), a failed
/// write, [`send_and_close`](crate::send_and_close) or a receive error gets
/// there first. It is also closed when the last clone is dropped.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<Shared>,
    writer: mpsc::UnboundedSender<WriteOp>,
}

impl Socket {
    /// Wraps a freshly connected stream and starts its writer task.
    ///
    /// `peer_addr` comes from the accept or connect that produced the
    /// stream; the peer may already have reset it. Must be called from
    /// inside a Tokio runtime.
    pub(crate) fn from_stream(
        stream: TcpStream,
        peer_addr: SocketAddr,
        id: ConnectionId,
        config: &NetConfig,
    ) -> std::io::Result<Self> {
        if let Err(e) = stream.set_nodelay(config.nodelay) {
            debug!(%id, peer = %peer_addr, error = %e, "failed to set nodelay");
        }
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            id,
            local_addr,
            peer_addr,
            closed: CancellationToken::new(),
            close_once: AtomicBool::new(false),
            reader: Mutex::new(Some(ReadSlot {
                half: read_half,
                chunk: vec![0; config.receive_buffer_size].into_boxed_slice(),
            })),
        });

        let (writer, ops) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(write_half, ops, Arc::clone(&shared)));

        Ok(Self { shared, writer })
    }

    /// Identifier of the handle that owns this socket.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Local end of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Remote end of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Returns `false` once the socket has been closed from this side,
    /// after a failed write, or after the peer closed and a receive saw it.
    pub fn is_connected(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    /// Closes the socket. Safe to call from any thread, any number of times.
    ///
    /// Pending reads and writes complete with an error; queued writes that
    /// have not started are dropped.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Hands bytes to the writer task.
    pub(crate) fn enqueue(&self, bytes: Vec<u8>, close_after: bool) -> Result<(), NetError> {
        self.writer
            .send(WriteOp { bytes, close_after })
            .map_err(|_| NetError::SendFailed(NetError::socket_closed()))
    }

    /// Reads one chunk. An empty result means the peer closed its side.
    pub(crate) async fn read_chunk(&self) -> std::io::Result<Vec<u8>> {
        let mut reader = self.shared.reader.lock().await;
        let Some(slot) = reader.as_mut() else {
            return Err(NetError::socket_closed());
        };

        let read = tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(NetError::socket_closed()),
            read = slot.half.read(&mut slot.chunk) => read,
        };

        match read {
            Ok(n) => {
                trace!(id = %self.shared.id, bytes = n, "read completed");
                Ok(slot.chunk[..n].to_vec())
            }
            Err(e) => {
                reader.take();
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Drains queued writes in order until the socket closes or every
/// [`Socket`] clone is gone.
async fn run_writer(
    mut half: OwnedWriteHalf,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    shared: Arc<Shared>,
) {
    loop {
        let op = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            written = half.write_all(&op.bytes) => written,
        };

        match written {
            Ok(()) => {
                trace!(id = %shared.id, bytes = op.bytes.len(), "write completed");
            }
            Err(e) => {
                let error = NetError::SendFailed(e);
                warn!(id = %shared.id, %error, "write failed, closing socket");
                shared.close();
                break;
            }
        }

        if op.close_after {
            shared.close();
            if let Err(e) = half.shutdown().await {
                trace!(id = %shared.id, error = %e, "shutdown after final write failed");
            }
            break;
        }
    }
    trace!(id = %shared.id, "writer task finished");
}
