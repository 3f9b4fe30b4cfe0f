//! Asynchronous, callback-driven TCP text streams.
//!
//! A process either accepts clients with [`start_server`] or dials out with
//! [`connect_to_server`]. Both end the same way: the handler you supplied
//! is called with a [`ConnectionHandle`]. From there the handler drives
//! the connection itself, calling [`receive`] when it wants more bytes and
//! [`send`] to write text. Every later event (new data, peer close, error)
//! comes back through the same handler.
//!
//! ```rust,no_run
//! use sockline::prelude::*;
//!
//! # async fn run() -> Result<(), NetError> {
//! let listener = start_server(
//!     |handle| {
//!         if handle.error_occurred() {
//!             return;
//!         }
//!         if handle.event() == NetEvent::Data {
//!             let text = handle.take_data();
//!             handle.send(&text);
//!         }
//!         receive(&handle);
//!     },
//!     11000,
//! )?;
//! # stop_server(Some(&listener))
//! # }
//! ```
//!
//! No framing is imposed: received text accumulates on the handle until
//! the application consumes it.
//!
//! # How it fits together
//!
//! ```text
//! accept engine ─┐
//!                ├─→ handler(ConnectionHandle) ─→ receive / send / send_and_close
//! connect engine ┘          ↑                          │
//!                           └──── Data / Closed / Error┘
//! ```

mod accept;
mod config;
mod connect;
mod error;
mod handle;
mod receive;
mod send;
mod socket;

pub use accept::{Listener, start_server, start_server_with, stop_server};
pub use config::NetConfig;
pub use connect::{ConnectAttempt, connect_to_server, connect_to_server_with};
pub use error::NetError;
pub use handle::{ConnectionHandle, EventHandler, NetEvent};
pub use receive::receive;
pub use send::{send, send_and_close};
pub use socket::Socket;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// Allocates the next process-unique id.
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        ConnectAttempt, ConnectionHandle, ConnectionId, Listener, NetConfig, NetError, NetEvent,
        Socket, connect_to_server, connect_to_server_with, receive, send, send_and_close,
        start_server, start_server_with, stop_server,
    };
}
