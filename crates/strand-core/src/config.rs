//! Centralized configuration for the RPC stack.
//!
//! Compile-time defaults live on unit structs as associated constants; the
//! runtime surface is [`RpcOptions`], which starts from those defaults.

use std::time::Duration;

/// Defaults for calls, streams, and connections.
pub struct RpcConfig;

impl RpcConfig {
    /// Default time a caller waits for a call result.
    pub const CALL_TIMEOUT: Duration = Duration::from_millis(30_000);
    /// Maximum unacknowledged writes per outbound stream.
    pub const STREAM_MAX_PENDING_ACK: usize = 4;
    /// Time a single stream write may wait for its ack.
    pub const STREAM_ACK_TIMEOUT: Duration = Duration::from_millis(5_000);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Largest frame accepted from a peer (16 MiB).
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    pub const MAX_CONNECTIONS: usize = 1024;
    pub const API_VERSION: &'static str = "1.0.0";
    /// Name of the hard-coded call every service answers with its manifest.
    pub const MANIFEST_CALL: &'static str = "getManifest";
}

/// Defaults for cluster command fan-out.
pub struct ClusterConfig;

impl ClusterConfig {
    pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(30_000);
    /// Selector that targets every registered worker.
    pub const ALL_WORKERS: &'static str = "*";
    /// Selector that targets the primary itself.
    pub const PRIMARY: &'static str = "PRIMARY";
}

/// Runtime options shared by callers, services and the router.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcOptions {
    pub call_timeout: Duration,
    pub stream_max_pending_ack: usize,
    pub stream_ack_timeout: Duration,
    /// Version string advertised in every service manifest.
    pub api_version: String,
    pub connect_timeout: Duration,
    pub max_frame_size: usize,
    pub max_connections: usize,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            call_timeout: RpcConfig::CALL_TIMEOUT,
            stream_max_pending_ack: RpcConfig::STREAM_MAX_PENDING_ACK,
            stream_ack_timeout: RpcConfig::STREAM_ACK_TIMEOUT,
            api_version: RpcConfig::API_VERSION.to_string(),
            connect_timeout: RpcConfig::CONNECT_TIMEOUT,
            max_frame_size: RpcConfig::MAX_FRAME_SIZE,
            max_connections: RpcConfig::MAX_CONNECTIONS,
        }
    }
}

impl RpcOptions {
    /// Set the default call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the ack window. Zero is clamped to one so a stream can make progress.
    pub fn with_stream_max_pending_ack(mut self, max: usize) -> Self {
        self.stream_max_pending_ack = max.max(1);
        self
    }

    /// Set how long a sent chunk may stay unacknowledged.
    pub fn with_stream_ack_timeout(mut self, timeout: Duration) -> Self {
        self.stream_ack_timeout = timeout;
        self
    }

    /// Set the version string advertised in manifests.
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Set the timeout for connecting and the namespace handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the largest frame accepted from a peer.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set how many connections the router accepts at once.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}
