//! Accept engine: a listening socket and its perpetual accept loop.
//!
//! The loop keeps exactly one accept outstanding. Each accepted stream
//! becomes a [`ConnectionHandle`] that is handed to the handler before the
//! next accept is armed. The first accept failure, including an explicit
//! stop, is reported to the handler and ends the loop; it is never retried.
//! A stream the peer reset before it could be set up is dropped and the
//! loop carries on.

use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ConnectionHandle, ConnectionId, EventHandler, NetConfig, NetError, NetEvent, Socket};

/// A running accept loop.
///
/// Dropping a `Listener` does not stop the loop; call
/// [`stop`](Self::stop) or [`stop_server`].
#[derive(Debug, Clone)]
pub struct Listener {
    local_addr: SocketAddr,
    stop: CancellationToken,
    socket: ListenSlot,
}

/// The listening socket, shared with the accept loop. `None` once closed.
type ListenSlot = Arc<Mutex<Option<TcpListener>>>;

impl Listener {
    /// Address the listener is bound to. Useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Closes the listening socket. The port is free again when this
    /// returns. The pending accept completes with "Listener stopped." and
    /// the loop ends.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!(addr = %self.local_addr, "stopping listener");
            self.stop.cancel();
        }
        let closed = self.socket.lock().take();
        drop(closed);
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Starts accepting on `port` on all interfaces with the default
/// [`NetConfig`].
///
/// See [`start_server_with`].
pub fn start_server(
    on_connected: impl Fn(ConnectionHandle) + Send + Sync + 'static,
    port: u16,
) -> Result<Listener, NetError> {
    start_server_with(NetConfig::default(), on_connected, port)
}

/// Binds `config.bind_ip:port`, starts listening and arms the accept loop.
///
/// `on_connected` is invoked with a [`NetEvent::Connected`] handle for every
/// inbound client, and once more with a [`NetEvent::Error`] handle when the
/// loop ends. Port 0 binds an ephemeral port; read it back from
/// [`Listener::local_addr`].
///
/// # Errors
///
/// [`NetError::Bind`] if the port cannot be bound, [`NetError::NoRuntime`]
/// outside a Tokio runtime.
pub fn start_server_with(
    config: NetConfig,
    on_connected: impl Fn(ConnectionHandle) + Send + Sync + 'static,
    port: u16,
) -> Result<Listener, NetError> {
    let config = config.validated();
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| NetError::NoRuntime)?;
    // Registering the listener with the reactor needs the runtime context.
    let _entered = runtime.enter();

    let bind_err = |source: std::io::Error| NetError::Bind { port, source };
    let addr = SocketAddr::new(config.bind_ip, port);
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(bind_err)?;
    #[cfg(not(windows))]
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    let listener = socket.listen(config.listen_backlog).map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;

    info!(addr = %local_addr, "listening");

    let stop = CancellationToken::new();
    let socket: ListenSlot = Arc::new(Mutex::new(Some(listener)));
    runtime.spawn(accept_loop(
        Arc::clone(&socket),
        Arc::new(on_connected),
        stop.clone(),
        config,
    ));

    Ok(Listener {
        local_addr,
        stop,
        socket,
    })
}

/// Stops `listener`.
///
/// # Errors
///
/// [`NetError::InvalidArgument`] when no listener is given.
pub fn stop_server(listener: Option<&Listener>) -> Result<(), NetError> {
    let listener = listener.ok_or(NetError::InvalidArgument("no listener to stop"))?;
    listener.stop();
    Ok(())
}

async fn accept_loop(
    listening: ListenSlot,
    on_connected: EventHandler,
    stop: CancellationToken,
    config: NetConfig,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => Err(NetError::ListenerStopped),
            accepted = poll_fn(|cx| poll_accept(&listening, cx)) => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                if matches!(e, NetError::ListenerStopped) {
                    info!("accept loop stopped");
                } else {
                    error!(error = %e, "accept failed, stopping accept loop");
                }
                let closed = listening.lock().take();
                drop(closed);
                ConnectionHandle::failed(e, Arc::clone(&on_connected)).notify(NetEvent::Error);
                break;
            }
        };

        let id = ConnectionId::next();
        match Socket::from_stream(stream, peer_addr, id, &config) {
            Ok(socket) => {
                debug!(%id, peer = %peer_addr, "accepted connection");
                ConnectionHandle::connected(socket, Arc::clone(&on_connected))
                    .notify(NetEvent::Connected);
            }
            Err(e) => {
                warn!(%id, peer = %peer_addr, error = %e, "dropping accepted connection");
            }
        }
    }
}

fn poll_accept(
    listening: &Mutex<Option<TcpListener>>,
    cx: &mut Context<'_>,
) -> Poll<Result<(TcpStream, SocketAddr), NetError>> {
    match listening.lock().as_ref() {
        Some(listener) => listener.poll_accept(cx).map_err(NetError::AcceptFailed),
        None => Poll::Ready(Err(NetError::ListenerStopped)),
    }
}
