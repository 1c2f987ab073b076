//! Error types for the strand RPC stack.
//!
//! Errors that leave a process are flattened into [`FlatError`] and rebuilt on
//! the far side as [`RpcError::Remote`]. The `message` survives byte-for-byte,
//! so callers can use it as a stable discriminator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Serializable form of an error: its message, an optional code, and any
/// other own properties the error carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl FlatError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            properties: Map::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Flatten an arbitrary error by copying its display message. The source
    /// chain is kept as a `causes` property when present.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut flat = Self::new(err.to_string());
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(Value::String(cause.to_string()));
            source = cause.source();
        }
        if !causes.is_empty() {
            flat.properties.insert("causes".to_string(), Value::Array(causes));
        }
        flat
    }
}

impl std::fmt::Display for FlatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Main error type for the RPC stack.
#[derive(Debug, Error)]
pub enum RpcError {
    // Call errors
    #[error("Request timeout after {timeout:?} waiting for '{call}'")]
    Timeout { call: String, timeout: Duration },

    #[error("Unknown call '{call}' in namespace '{namespace}'")]
    UnknownCall { namespace: String, call: String },

    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("Invalid arguments for '{call}': {message}")]
    InvalidArgs { call: String, message: String },

    /// Raised by a handler. Flattens to exactly these fields.
    #[error("{message}")]
    Handler {
        message: String,
        code: Option<String>,
        properties: Map<String, Value>,
    },

    /// Rebuilt from the flattened form a peer sent.
    #[error("{0}")]
    Remote(FlatError),

    // Connection errors
    #[error("Connection closed")]
    Disconnected,

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Stream errors
    #[error("Stream {stream_id} ack timeout after {timeout:?}")]
    AckTimeout { stream_id: String, timeout: Duration },

    #[error("Stream {stream_id} was hung up by its consumer")]
    StreamHangup { stream_id: String },

    #[error("Stream {stream_id} is closed")]
    StreamClosed { stream_id: String },

    #[error("Stream {stream_id} is not supported: a handle must be exactly readable or writable")]
    DuplexStream { stream_id: String },

    #[error("Streams are not supported on single-shot calls")]
    StreamingUnsupported,

    #[error("Plain value uses the reserved stream handle shape {{streamId, readable, writable}}")]
    ReservedStreamShape,

    // Cluster command errors
    #[error("Command {uids} is already in flight")]
    DuplicateUids { uids: String },

    #[error("Command {uids} timed out after {timeout:?}")]
    CommandTimeout { uids: String, timeout: Duration },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Invalid worker selector: {0}")]
    InvalidSelector(String),

    #[error("Worker {0} exited")]
    WorkerExited(u32),

    #[error("Cluster primary unavailable")]
    PrimaryUnavailable,
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<FlatError> for RpcError {
    fn from(flat: FlatError) -> Self {
        RpcError::from_flat(flat)
    }
}

impl RpcError {
    /// Error raised from inside a handler.
    pub fn handler(message: impl Into<String>) -> Self {
        RpcError::Handler {
            message: message.into(),
            code: None,
            properties: Map::new(),
        }
    }

    /// Handler error carrying an application code.
    pub fn handler_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        RpcError::Handler {
            message: message.into(),
            code: Some(code.into()),
            properties: Map::new(),
        }
    }

    /// Handler that panicked instead of returning.
    pub fn handler_panicked(name: &str) -> Self {
        RpcError::handler_with_code(format!("Handler '{}' panicked", name), "HandlerPanic")
    }

    /// Rebuild an error from its flattened form.
    pub fn from_flat(flat: FlatError) -> Self {
        RpcError::Remote(flat)
    }

    /// Stable string code, carried on the wire next to the message.
    pub fn code(&self) -> String {
        match self {
            RpcError::Timeout { .. } => "RequestTimeout".to_string(),
            RpcError::UnknownCall { .. } => "UnknownCall".to_string(),
            RpcError::UnknownNamespace(_) => "UnknownNamespace".to_string(),
            RpcError::InvalidArgs { .. } => "InvalidArguments".to_string(),
            RpcError::Handler { code, .. } => {
                code.clone().unwrap_or_else(|| "HandlerError".to_string())
            }
            RpcError::Remote(flat) => flat.code.clone().unwrap_or_else(|| "RemoteError".to_string()),
            RpcError::Disconnected => "Disconnected".to_string(),
            RpcError::Io { .. } => "IoError".to_string(),
            RpcError::Json { .. } => "JsonError".to_string(),
            RpcError::Protocol(_) | RpcError::FrameTooLarge { .. } => "ProtocolError".to_string(),
            RpcError::AckTimeout { .. } => "StreamAckTimeout".to_string(),
            RpcError::StreamHangup { .. } => "StreamHangup".to_string(),
            RpcError::StreamClosed { .. } => "StreamClosed".to_string(),
            RpcError::DuplexStream { .. } | RpcError::StreamingUnsupported => {
                "StreamUnsupported".to_string()
            }
            RpcError::ReservedStreamShape => "ReservedStreamShape".to_string(),
            RpcError::DuplicateUids { .. } => "DuplicateUids".to_string(),
            RpcError::CommandTimeout { .. } => "CommandTimeout".to_string(),
            RpcError::NotImplemented(_) => "NotImplemented".to_string(),
            RpcError::InvalidSelector(_) => "InvalidSelector".to_string(),
            RpcError::WorkerExited(_) => "WorkerExited".to_string(),
            RpcError::PrimaryUnavailable => "PrimaryUnavailable".to_string(),
        }
    }

    /// Flatten into the form sent to a peer.
    ///
    /// Handler errors keep their own fields and remote errors pass through
    /// untouched. IO and JSON errors also carry their source chain as
    /// `causes`. Everything else is described by its message and code.
    pub fn flatten(&self) -> FlatError {
        match self {
            RpcError::Remote(flat) => flat.clone(),
            RpcError::Handler {
                message,
                code,
                properties,
            } => FlatError {
                message: message.clone(),
                code: code.clone(),
                properties: properties.clone(),
            },
            RpcError::Io { .. } | RpcError::Json { .. } => {
                FlatError::from_error(self).with_code(self.code())
            }
            other => FlatError::new(other.to_string()).with_code(other.code()),
        }
    }

    /// Message used as the discriminator after a round trip.
    pub fn message(&self) -> String {
        match self {
            RpcError::Remote(flat) => flat.message.clone(),
            RpcError::Handler { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// True for caller-side call timeouts, local or reconstructed.
    pub fn is_timeout(&self) -> bool {
        match self {
            RpcError::Timeout { .. } => true,
            RpcError::Remote(flat) => flat.code.as_deref() == Some("RequestTimeout"),
            _ => false,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard codes:
    /// - -32700: Parse error
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes (-32000 to -32099):
    /// - -32000: Connectivity / timeout
    /// - -32001: Unknown namespace
    /// - -32002: Handler error
    /// - -32003: Stream error
    /// - -32004: Cluster command error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RpcError::Json { .. } => -32700,

            RpcError::UnknownCall { .. } | RpcError::NotImplemented(_) => -32601,

            RpcError::InvalidArgs { .. }
            | RpcError::StreamingUnsupported
            | RpcError::ReservedStreamShape => -32602,

            RpcError::Timeout { .. }
            | RpcError::Disconnected
            | RpcError::Io { .. }
            | RpcError::PrimaryUnavailable => -32000,

            RpcError::UnknownNamespace(_) => -32001,

            RpcError::Handler { .. } | RpcError::Remote(_) => -32002,

            RpcError::AckTimeout { .. }
            | RpcError::StreamHangup { .. }
            | RpcError::StreamClosed { .. }
            | RpcError::DuplexStream { .. } => -32003,

            RpcError::DuplicateUids { .. }
            | RpcError::CommandTimeout { .. }
            | RpcError::InvalidSelector(_)
            | RpcError::WorkerExited(_) => -32004,

            _ => -32603,
        }
    }
}
