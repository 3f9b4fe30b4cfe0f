//! Send engine: fire-and-forget writes of UTF-8 text.
//!
//! Neither function waits for the write. They hand the bytes to the
//! socket's writer task and report whether that worked. A write that fails
//! later is logged and closes the socket; the application notices through
//! [`Socket::is_connected`] or its next [`receive`](crate::receive).

use tracing::{trace, warn};

use crate::Socket;

/// Starts writing `data` to `socket`.
///
/// Returns `false` without doing any I/O if the socket is already closed.
/// Returns `true` once the write is queued; it completes asynchronously and
/// in call order relative to other sends on the same socket. If the write
/// cannot be queued the socket is closed and `false` is returned.
pub fn send(socket: &Socket, data: &str) -> bool {
    start_send(socket, data, false)
}

/// Like [`send`], but closes the socket once the write finishes, whether it
/// succeeded or not.
///
/// Meant for one-shot replies after which the connection has no purpose.
pub fn send_and_close(socket: &Socket, data: &str) -> bool {
    start_send(socket, data, true)
}

fn start_send(socket: &Socket, data: &str, close_after: bool) -> bool {
    if !socket.is_connected() {
        trace!(id = %socket.id(), "send on closed socket skipped");
        return false;
    }

    match socket.enqueue(data.as_bytes().to_vec(), close_after) {
        Ok(()) => {
            trace!(id = %socket.id(), bytes = data.len(), close_after, "send queued");
            true
        }
        Err(e) => {
            warn!(id = %socket.id(), error = %e, "could not start send, closing socket");
            socket.close();
            false
        }
    }
}
