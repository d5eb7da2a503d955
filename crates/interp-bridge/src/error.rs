//! Error types for the interpreter bridge.
//!
//! Failures are split by where they happened:
//! - `Transport`: the connection itself failed (refused, reset, timed out, desync)
//! - `Protocol`: a response arrived but could not be parsed into the expected shape
//! - `Remote`: the far side answered with a structured failure
//! - `Registration`: a `Remote` failure raised while binding handlers from source
//! - `PortExhausted`: the supervisor could not find a free port

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a connection-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportErrorKind {
    Refused,
    Reset,
    TimedOut,
    Closed,
    Desync,
    Other,
}

impl TransportErrorKind {
    pub fn from_io(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportErrorKind::Reset,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportErrorKind::TimedOut,
            ErrorKind::NotConnected => TransportErrorKind::Closed,
            _ => TransportErrorKind::Other,
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Refused => "connection refused",
            TransportErrorKind::Reset => "connection reset",
            TransportErrorKind::TimedOut => "timed out",
            TransportErrorKind::Closed => "connection closed",
            TransportErrorKind::Desync => "protocol desync",
            TransportErrorKind::Other => "transport failure",
        };
        f.write_str(s)
    }
}

/// A failure that happened on the far side of the bridge.
///
/// `remote_traceback` is kept exactly as the remote side produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub remote_type_name: String,
    pub message: String,
    pub remote_traceback: String,
}

impl RemoteError {
    /// Build a remote error whose traceback is the single `Type: message` line.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        let remote_type_name = type_name.into();
        let message = message.into();
        let remote_traceback = format!("{}: {}\n", remote_type_name, message);
        Self {
            remote_type_name,
            message,
            remote_traceback,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.remote_traceback = traceback.into();
        self
    }

    /// `NameError` for a handler name that is not registered.
    pub fn unknown_handler(name: &str) -> Self {
        Self::new("NameError", format!("name '{}' is not defined", name))
    }

    /// Check the remote exception type by name.
    pub fn is_type(&self, type_name: &str) -> bool {
        self.remote_type_name == type_name
    }

    /// Multi-line rendering for logs and display.
    ///
    /// The remote traceback is reproduced verbatim under a local header.
    pub fn formatted_traceback(&self) -> String {
        let mut out = format!(
            "Remote {} raised across the bridge: {}\n",
            self.remote_type_name, self.message
        );
        out.push_str(&self.remote_traceback);
        if !self.remote_traceback.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.remote_type_name, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    // Connection-level errors
    #[error("Transport error ({kind}) talking to {addr}: {message}")]
    Transport {
        addr: String,
        kind: TransportErrorKind,
        message: String,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Remote-side failures
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Registration failed: {0}")]
    Registration(RemoteError),

    // Process supervision errors
    #[error("No free port for {name} after {attempts} attempts starting at {start}")]
    PortExhausted {
        name: String,
        start: u16,
        attempts: u32,
    },

    #[error("Failed to spawn {executable:?}: {message}")]
    Spawn {
        executable: PathBuf,
        message: String,
    },

    #[error("Interpreter exited before becoming ready ({status}): {stderr_tail}")]
    ChildExited { status: String, stderr_tail: String },

    #[error("Interpreter on port {port} did not become ready within {timeout:?}")]
    NotReady { port: u16, timeout: Duration },

    // Marshalling errors
    #[error("Marshal error: {message}")]
    Marshal { message: String },

    #[error("Method {method} is not declared on {interface}")]
    UndeclaredMethod { interface: String, method: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RemoteError> for BridgeError {
    fn from(err: RemoteError) -> Self {
        BridgeError::Remote(err)
    }
}

impl BridgeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BridgeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Connection-level failure derived from an IO error.
    pub fn transport(addr: impl fmt::Display, err: &std::io::Error) -> Self {
        BridgeError::Transport {
            addr: addr.to_string(),
            kind: TransportErrorKind::from_io(err.kind()),
            message: err.to_string(),
        }
    }

    pub fn marshal(message: impl Into<String>) -> Self {
        BridgeError::Marshal {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            message: message.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, BridgeError::Transport { .. })
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            BridgeError::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// True for both plain remote failures and registration failures.
    pub fn is_remote(&self) -> bool {
        matches!(self, BridgeError::Remote(_) | BridgeError::Registration(_))
    }

    /// The structured remote failure, if this error carries one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            BridgeError::Remote(e) | BridgeError::Registration(e) => Some(e),
            _ => None,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32603: Internal error
    ///
    /// Application codes:
    /// - -32000: Remote handler raised
    /// - -32001: Registration failed
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            BridgeError::Remote(e) if e.is_type("NameError") => -32601,
            BridgeError::Remote(_) => -32000,
            BridgeError::Registration(_) => -32001,
            BridgeError::Protocol { .. } => -32600,
            BridgeError::Json { .. } => -32700,
            _ => -32603,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::PortExhausted {
            name: "proj@py".into(),
            start: 18000,
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "No free port for proj@py after 3 attempts starting at 18000"
        );
    }

    #[test]
    fn test_transport_kind_from_io() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let bridge = BridgeError::transport("127.0.0.1:1", &err);
        assert_eq!(bridge.transport_kind(), Some(TransportErrorKind::Refused));
        assert!(bridge.is_transport());
        assert!(!bridge.is_remote());
    }

    #[test]
    fn test_formatted_traceback_keeps_remote_text() {
        let remote = RemoteError::new("AssertionError", "assertion failed").with_traceback(
            "Traceback (most recent call last):\n  File \"<bridge>\", line 1, in run\nAssertionError: assertion failed",
        );
        let formatted = remote.formatted_traceback();
        assert!(formatted.starts_with("Remote AssertionError"));
        assert!(formatted.contains(&remote.remote_traceback));
        assert!(formatted.ends_with('\n'));
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            BridgeError::Remote(RemoteError::unknown_handler("nope")).to_rpc_error_code(),
            -32601
        );
        assert_eq!(
            BridgeError::Registration(RemoteError::new("NameError", "x")).to_rpc_error_code(),
            -32001
        );
        assert_eq!(BridgeError::Other("x".into()).to_rpc_error_code(), -32603);
    }

    #[test]
    fn test_remote_accessor() {
        let err = BridgeError::Registration(RemoteError::new("SyntaxError", "bad"));
        assert!(err.is_remote());
        assert!(err.remote().unwrap().is_type("SyntaxError"));
    }
}
