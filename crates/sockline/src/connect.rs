//! Connect engine: resolve, connect with a timeout, notify exactly once.
//!
//! The connect future and the timer are polled by a single `select!`, so
//! exactly one of them produces the attempt's outcome and the other is
//! dropped unpolled. The handler is called once, after the select, with
//! whatever came out of it.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{ConnectionHandle, ConnectionId, EventHandler, NetConfig, NetError, NetEvent, Socket};

/// A connect attempt in progress.
///
/// Dropping it does not cancel the attempt.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    cancel: CancellationToken,
}

impl ConnectAttempt {
    /// Abandons the attempt if it has not finished yet. The handler is then
    /// invoked with "Connection cancelled." instead of the real outcome.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Connects to `host:port` with the default [`NetConfig`].
///
/// See [`connect_to_server_with`].
pub fn connect_to_server(
    on_ready: impl Fn(ConnectionHandle) + Send + Sync + 'static,
    host: &str,
    port: u16,
) -> ConnectAttempt {
    connect_to_server_with(NetConfig::default(), on_ready, host, port)
}

/// Starts connecting to `host:port` and returns immediately.
///
/// `host` may be a name or a literal address. Names resolve to their first
/// IPv4 address; if resolution fails the input is tried as a literal IPv4
/// or IPv6 address. `on_ready` is invoked exactly once, either with a
/// connected handle ([`NetEvent::Connected`]) or an error-only handle
/// ([`NetEvent::Error`]) whose message is one of:
///
/// - "Error with Name": neither resolvable nor a literal.
/// - "Connection timed out.": no answer within `config.connect_timeout`.
/// - "Connection cancelled.": [`ConnectAttempt::cancel`] was called.
/// - the OS message for refused or unreachable connects.
///
/// Every outcome, name errors included, is delivered from a spawned task
/// after this returns, since resolution itself is asynchronous. Only
/// outside a Tokio runtime does `on_ready` run synchronously, with an error.
pub fn connect_to_server_with(
    config: NetConfig,
    on_ready: impl Fn(ConnectionHandle) + Send + Sync + 'static,
    host: &str,
    port: u16,
) -> ConnectAttempt {
    let config = config.validated();
    let on_ready: EventHandler = Arc::new(on_ready);
    let cancel = CancellationToken::new();

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        ConnectionHandle::failed(NetError::NoRuntime, on_ready).notify(NetEvent::Error);
        return ConnectAttempt { cancel };
    };

    let host = host.to_owned();
    let token = cancel.clone();
    runtime.spawn(async move {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(NetError::ConnectCancelled),
            outcome = connect(&host, port, &config) => outcome,
        };

        let (handle, event) = match outcome {
            Ok(socket) => {
                debug!(id = %socket.id(), peer = %socket.peer_addr(), "connected");
                (ConnectionHandle::connected(socket, on_ready), NetEvent::Connected)
            }
            Err(e) => {
                debug!(%host, port, error = %e, "connect failed");
                (ConnectionHandle::failed(e, on_ready), NetEvent::Error)
            }
        };
        handle.notify(event);
    });

    ConnectAttempt { cancel }
}

async fn connect(host: &str, port: u16, config: &NetConfig) -> Result<Socket, NetError> {
    let addr = resolve(host, port).await?;

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(NetError::ConnectFailed)?;
    socket
        .set_nodelay(config.nodelay)
        .map_err(NetError::ConnectFailed)?;

    let id = ConnectionId::next();
    debug!(%id, %addr, "connecting");

    let stream = race_connect(socket.connect(addr), config.connect_timeout).await?;
    Socket::from_stream(stream, addr, id, config).map_err(NetError::ConnectFailed)
}

/// Resolves `host` to one address.
///
/// The first IPv4 result wins. A literal address is the fallback when
/// resolution fails or yields only IPv6.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    let literal = host
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, port));

    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs
            .find(SocketAddr::is_ipv4)
            .or(literal)
            .ok_or(NetError::NoIpv4Address),
        Err(e) => {
            trace!(host, error = %e, "name resolution failed");
            literal.ok_or(NetError::Resolution)
        }
    }
}

/// Races `connect` against a `timeout` timer. Exactly one outcome comes
/// out; if both are ready at the same poll the connect wins.
async fn race_connect<T>(
    connect: impl Future<Output = std::io::Result<T>>,
    timeout: Duration,
) -> Result<T, NetError> {
    tokio::select! {
        biased;
        connected = connect => connected.map_err(NetError::ConnectFailed),
        () = tokio::time::sleep(timeout) => Err(NetError::ConnectTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    const TIMEOUT: Duration = NetConfig::DEFAULT_CONNECT_TIMEOUT;

    #[tokio::test(start_paused = true)]
    async fn test_never_answering_connect_times_out_at_deadline() {
        let start = Instant::now();
        let outcome = race_connect(std::future::pending::<std::io::Result<()>>(), TIMEOUT).await;
        assert!(matches!(outcome, Err(NetError::ConnectTimeout)));
        let elapsed = start.elapsed();
        assert!(elapsed >= TIMEOUT, "fired early: {elapsed:?}");
        assert!(elapsed < TIMEOUT + Duration::from_millis(5), "fired late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_just_before_deadline_wins() {
        let connect = async {
            tokio::time::sleep(TIMEOUT - Duration::from_millis(1)).await;
            Ok(())
        };
        assert!(race_connect(connect, TIMEOUT).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_just_after_deadline_loses() {
        let connect = async {
            tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
            Ok(())
        };
        assert!(matches!(
            race_connect(connect, TIMEOUT).await,
            Err(NetError::ConnectTimeout)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_goes_to_connect() {
        let connect = async {
            tokio::time::sleep(TIMEOUT).await;
            Ok(())
        };
        assert!(race_connect(connect, TIMEOUT).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_keeps_os_error() {
        let connect = async {
            Err::<(), _>(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
        };
        match race_connect(connect, TIMEOUT).await {
            Err(NetError::ConnectFailed(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused)
            }
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_ipv4_literal() {
        let addr = resolve("127.0.0.1", 2112).await.unwrap();
        assert_eq!(addr, "127.0.0.1:2112".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_ipv6_literal_falls_back() {
        let addr = resolve("::1", 2112).await.unwrap();
        assert_eq!(addr, "[::1]:2112".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_garbage_is_name_error() {
        let err = resolve("not a real host###", 2112).await.unwrap_err();
        assert!(matches!(err, NetError::Resolution));
        assert_eq!(err.to_string(), "Error with Name");
    }
}
