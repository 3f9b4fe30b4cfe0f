//! Receive engine: one read per call, then one handler invocation.
//!
//! The engine never re-arms itself. The application calls [`receive`]
//! again when it is ready for more bytes, so at most one read per handle
//! is ever in flight.

use tracing::{debug, trace, warn};

use crate::{ConnectionHandle, NetError, NetEvent};

/// Reads one chunk into `handle`'s accumulated text, then invokes its
/// handler.
///
/// Outcomes seen by the handler:
/// - [`NetEvent::Data`]: new text was appended.
/// - [`NetEvent::Closed`]: the peer closed; the socket is closed and the
///   error is set to "Connection closed by peer.". A trailing incomplete
///   character is kept as U+FFFD.
/// - [`NetEvent::Error`]: the read failed; the socket is closed and the
///   error starts with "Error receiving data:".
///
/// If the read cannot be issued at all (error-only handle, closed socket,
/// no runtime) the error is recorded and the handler runs synchronously on
/// the calling thread. Calling this while a read is already pending logs a
/// warning and does nothing.
pub fn receive(handle: &ConnectionHandle) {
    let socket = match handle.socket() {
        Some(socket) if socket.is_connected() => socket.clone(),
        _ => {
            debug!(id = %handle.id(), "receive on closed connection");
            handle.fail(
                NetEvent::Error,
                NetError::ReceiveFailed(NetError::socket_closed()),
            );
            return;
        }
    };

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        handle.fail(NetEvent::Error, NetError::NoRuntime);
        return;
    };

    if !handle.begin_receive() {
        warn!(id = %handle.id(), "receive already pending, ignoring");
        return;
    }

    let handle = handle.clone();
    runtime.spawn(async move {
        let read = socket.read_chunk().await;
        // Cleared before notifying so the handler can ask for more.
        handle.end_receive();

        match read {
            Ok(chunk) if chunk.is_empty() => {
                debug!(id = %handle.id(), "peer closed connection");
                socket.close();
                handle.finish_text();
                handle.fail(NetEvent::Closed, NetError::PeerClosed);
            }
            Ok(chunk) => {
                handle.append(&chunk);
                trace!(id = %handle.id(), bytes = chunk.len(), "received");
                handle.notify(NetEvent::Data);
            }
            Err(e) => {
                debug!(id = %handle.id(), error = %e, "receive failed");
                socket.close();
                handle.finish_text();
                handle.fail(NetEvent::Error, NetError::ReceiveFailed(e));
            }
        }
    });
}
