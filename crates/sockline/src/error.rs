//! Error types for the networking layer.

/// Errors that can occur anywhere in the networking layer.
///
/// Most of these never reach the caller as a `Result`: the engines store
/// them on the [`ConnectionHandle`](crate::ConnectionHandle) and invoke the
/// event handler instead. The `Display` text is what
/// [`ConnectionHandle::error_message`](crate::ConnectionHandle::error_message)
/// reports.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The listening socket could not be bound or put into listen mode.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The host could neither be resolved nor parsed as a literal address.
    #[error("Error with Name")]
    Resolution,

    /// Resolution succeeded but produced no IPv4 address.
    #[error("No IPV4 address found in the server")]
    NoIpv4Address,

    /// The connect attempt did not finish before the timeout.
    #[error("Connection timed out.")]
    ConnectTimeout,

    /// The transport refused or reset the connect attempt.
    #[error("{0}")]
    ConnectFailed(#[source] std::io::Error),

    /// The attempt was abandoned through [`ConnectAttempt::cancel`](crate::ConnectAttempt::cancel).
    #[error("Connection cancelled.")]
    ConnectCancelled,

    /// Accepting or finalizing an inbound connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The listener was stopped while an accept was pending.
    #[error("Listener stopped.")]
    ListenerStopped,

    /// A read could not be issued or failed while pending.
    #[error("Error receiving data: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// The peer closed its side of the connection (zero-byte read).
    #[error("Connection closed by peer.")]
    PeerClosed,

    /// A write failed. Only ever logged; the socket is closed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// The caller passed something the API cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An engine was started outside a Tokio runtime.
    #[error("no Tokio runtime is running")]
    NoRuntime,
}

impl NetError {
    /// Builds the error used when an operation hits an already-closed socket.
    pub(crate) fn socket_closed() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "socket is closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_message_matches_handler_contract() {
        assert_eq!(NetError::Resolution.to_string(), "Error with Name");
    }

    #[test]
    fn test_timeout_message_matches_handler_contract() {
        assert_eq!(NetError::ConnectTimeout.to_string(), "Connection timed out.");
    }

    #[test]
    fn test_connect_failed_carries_os_message() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = NetError::ConnectFailed(io);
        assert_eq!(err.to_string(), "refused");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_receive_failed_prefixes_message() {
        let err = NetError::ReceiveFailed(NetError::socket_closed());
        assert_eq!(err.to_string(), "Error receiving data: socket is closed");
    }

    #[test]
    fn test_bind_error_names_port() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = NetError::Bind { port: 11000, source: io };
        assert!(err.to_string().contains("11000"));
        assert!(err.to_string().contains("in use"));
    }
}
