//! Tunables shared by all engines.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// NetConfig
// ---------------------------------------------------------------------------

/// Configuration for sockets created by the accept and connect engines.
///
/// The defaults reproduce the fixed behavior of the layer: a 3 second
/// connect timeout, 4 KiB receive chunks and Nagle disabled. Missing
/// fields fall back to their defaults when deserializing, so a config
/// file only has to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// How long a connect attempt may take before it fails with
    /// "Connection timed out.".
    pub connect_timeout: Duration,

    /// Capacity of the per-connection inbound chunk. One `receive` reads at
    /// most this many bytes.
    pub receive_buffer_size: usize,

    /// Disable send coalescing so small writes go out immediately.
    pub nodelay: bool,

    /// Interface the accept engine binds to. All interfaces by default.
    pub bind_ip: IpAddr,

    /// Pending-connection queue length passed to `listen`.
    pub listen_backlog: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            receive_buffer_size: Self::DEFAULT_RECEIVE_BUFFER_SIZE,
            nodelay: true,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_backlog: 1024,
        }
    }
}

impl NetConfig {
    /// Connect timeout used unless overridden.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

    /// Inbound chunk capacity used unless overridden.
    pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 4096;

    /// Replace out-of-range values so the config is safe to use.
    ///
    /// Called by every engine before the config is used. Rules:
    /// - a zero `connect_timeout` becomes the default (a zero timer would
    ///   fail every attempt before the first SYN).
    /// - a zero `receive_buffer_size` becomes the default (a zero-length
    ///   read is indistinguishable from a peer close).
    /// - a zero `listen_backlog` becomes 1.
    pub fn validated(mut self) -> Self {
        if self.connect_timeout.is_zero() {
            warn!("connect_timeout is zero, using default");
            self.connect_timeout = Self::DEFAULT_CONNECT_TIMEOUT;
        }
        if self.receive_buffer_size == 0 {
            warn!("receive_buffer_size is zero, using default");
            self.receive_buffer_size = Self::DEFAULT_RECEIVE_BUFFER_SIZE;
        }
        if self.listen_backlog == 0 {
            warn!("listen_backlog is zero, using 1");
            self.listen_backlog = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_fixed_behavior() {
        let config = NetConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_millis(3000));
        assert_eq!(config.receive_buffer_size, 4096);
        assert!(config.nodelay);
        assert_eq!(config.bind_ip, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_validated_replaces_zero_values() {
        let config = NetConfig {
            connect_timeout: Duration::ZERO,
            receive_buffer_size: 0,
            listen_backlog: 0,
            ..NetConfig::default()
        }
        .validated();
        assert_eq!(config.connect_timeout, NetConfig::DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.receive_buffer_size, NetConfig::DEFAULT_RECEIVE_BUFFER_SIZE);
        assert_eq!(config.listen_backlog, 1);
    }

    #[test]
    fn test_validated_keeps_sane_values() {
        let config = NetConfig {
            connect_timeout: Duration::from_millis(250),
            receive_buffer_size: 16,
            ..NetConfig::default()
        };
        assert_eq!(config.clone().validated(), config);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: NetConfig =
            serde_json::from_str(r#"{ "receive_buffer_size": 512 }"#).unwrap();
        assert_eq!(config.receive_buffer_size, 512);
        assert_eq!(config.connect_timeout, NetConfig::DEFAULT_CONNECT_TIMEOUT);
        assert!(config.nodelay);
    }
}
