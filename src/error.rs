//! Error types for the dispensing client.
//!
//! Every fault the engine can hit is expressed as a [`DoserError`]. None of them is
//! fatal to the process: links report connection faults through their error callback
//! and fall back to `Disconnected`, protocol faults are logged and dropped, and the
//! control laws answer "no result" instead of failing.
//!
//! ## Error Categories
//!
//! - **Connection Errors**: connect timeouts, refused connections, resets and peer closes
//! - **Protocol Errors**: malformed packets, unexpected tokens, numeric parse failures
//! - **Computation Errors**: control-law inputs that cannot produce an actuation
//! - **Configuration Errors**: unreadable or invalid configuration values
//! - **File Errors**: target sheets and result files
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use doser::{ConnectionErrorKind, DoserError};
//!
//! let error = DoserError::connection_failed(ConnectionErrorKind::Refused, "127.0.0.1:1023");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T, E = DoserError> = std::result::Result<T, E>;

/// Distinguishes the ways a TCP link can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The connect or write did not finish within the configured timeout.
    Timeout,
    /// The server actively refused the connection.
    Refused,
    /// The connection was reset or aborted by the peer.
    Reset,
    /// The peer closed the connection (zero-length read).
    Closed,
    /// Any other socket error.
    Io,
}

impl ConnectionErrorKind {
    /// Map an I/O error onto a connection error kind.
    pub fn classify(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectionErrorKind::Timeout,
            ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ConnectionErrorKind::Reset
            }
            ErrorKind::UnexpectedEof | ErrorKind::NotConnected => ConnectionErrorKind::Closed,
            _ => ConnectionErrorKind::Io,
        }
    }
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionErrorKind::Timeout => "timed out",
            ConnectionErrorKind::Refused => "connection refused",
            ConnectionErrorKind::Reset => "connection reset",
            ConnectionErrorKind::Closed => "connection closed by peer",
            ConnectionErrorKind::Io => "I/O error",
        };
        f.write_str(text)
    }
}

/// Main error type for client operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DoserError {
    #[error("Connection to {endpoint} failed: {kind}")]
    Connection {
        kind: ConnectionErrorKind,
        endpoint: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Link is not connected")]
    NotConnected,

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Protocol error in {context}: {details}")]
    Protocol { context: String, details: String },

    #[error("Control law could not compute: {details}")]
    Computation { details: String },

    #[error("Invalid configuration value '{key}': {details}")]
    Configuration { key: String, details: String },

    #[error("File error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },
}

impl DoserError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            DoserError::Connection { kind, .. } => *kind != ConnectionErrorKind::Io,
            DoserError::NotConnected => true,
            DoserError::Timeout { .. } => true,
            DoserError::Protocol { .. } => false,
            DoserError::Computation { .. } => false,
            DoserError::Configuration { .. } => false,
            DoserError::File { .. } => false,
            DoserError::InvalidState { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            DoserError::Connection { kind: ConnectionErrorKind::Refused, .. } => vec![
                "Check the rig server is running",
                "Verify the configured host and port",
            ],
            DoserError::Connection { .. } | DoserError::NotConnected => vec![
                "Reconnect the link",
                "Check network reachability of the rig",
                "Increase the socket timeout",
            ],
            DoserError::Timeout { .. } => {
                vec!["Increase timeout duration", "Verify the rig is responding"]
            }
            DoserError::Protocol { .. } => vec![
                "Check the server speaks the '<a> <b> <c> <d> #' packet format",
                "Inspect the link logs for the raw record",
            ],
            DoserError::Computation { .. } => vec![
                "Check material density is positive",
                "Verify target and current weights are finite numbers",
            ],
            DoserError::Configuration { .. } => vec![
                "Check the configuration file syntax",
                "Delete the file to regenerate defaults",
            ],
            DoserError::File { .. } => vec![
                "Check file exists and is readable",
                "Check directory permissions",
            ],
            DoserError::InvalidState { .. } => {
                vec!["Connect the control link and load targets before starting"]
            }
        }
    }

    /// Helper constructor for connection errors without an underlying I/O error.
    pub fn connection_failed(kind: ConnectionErrorKind, endpoint: impl Into<String>) -> Self {
        DoserError::Connection { kind, endpoint: endpoint.into(), source: None }
    }

    /// Helper constructor for connection errors caused by an I/O error.
    pub fn connection_io(endpoint: impl Into<String>, source: std::io::Error) -> Self {
        DoserError::Connection {
            kind: ConnectionErrorKind::classify(&source),
            endpoint: endpoint.into(),
            source: Some(source),
        }
    }

    /// Helper constructor for protocol errors.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        DoserError::Protocol { context: context.into(), details: details.into() }
    }

    /// Helper constructor for computation errors.
    pub fn computation(details: impl Into<String>) -> Self {
        DoserError::Computation { details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn configuration(key: impl Into<String>, details: impl Into<String>) -> Self {
        DoserError::Configuration { key: key.into(), details: details.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DoserError::File { path: path.into(), source }
    }

    /// Helper constructor for refused state transitions.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        DoserError::InvalidState { reason: reason.into() }
    }

    /// The connection error kind, if this is a connection error.
    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            DoserError::Connection { kind, .. } => Some(*kind),
            DoserError::Timeout { .. } => Some(ConnectionErrorKind::Timeout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            endpoint in "[a-z0-9.]{1,20}:[0-9]{1,5}",
            context in "\\w+",
            details in ".*",
            key in "\\w+"
          ) {
            let connection =
                DoserError::connection_failed(ConnectionErrorKind::Refused, endpoint.clone());
            let protocol = DoserError::protocol(context.clone(), details.clone());
            let config = DoserError::configuration(key.clone(), details.clone());

            prop_assert!(connection.to_string().contains(&endpoint));
            prop_assert!(protocol.to_string().contains(&context));
            prop_assert!(protocol.to_string().contains(&details));
            prop_assert!(config.to_string().contains(&key));
          }

          #[test]
          fn io_source_is_preserved(reason in ".+") {
            let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, reason.clone());
            let error = DoserError::connection_io("rig:1023", io);

            prop_assert_eq!(error.connection_kind(), Some(ConnectionErrorKind::Reset));
            let source = std::error::Error::source(&error).map(|s| s.to_string());
            prop_assert_eq!(source, Some(reason));
          }
        }
    }

    #[test]
    fn io_errors_are_classified() {
        use std::io::{Error, ErrorKind};

        let cases = [
            (ErrorKind::TimedOut, ConnectionErrorKind::Timeout),
            (ErrorKind::ConnectionRefused, ConnectionErrorKind::Refused),
            (ErrorKind::ConnectionReset, ConnectionErrorKind::Reset),
            (ErrorKind::BrokenPipe, ConnectionErrorKind::Reset),
            (ErrorKind::UnexpectedEof, ConnectionErrorKind::Closed),
            (ErrorKind::PermissionDenied, ConnectionErrorKind::Io),
        ];

        for (io_kind, expected) in cases {
            assert_eq!(ConnectionErrorKind::classify(&Error::from(io_kind)), expected);
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<DoserError>();

        let error = DoserError::NotConnected;
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn recovery_methods_work() {
        let refused = DoserError::connection_failed(ConnectionErrorKind::Refused, "rig:1023");
        let io = DoserError::connection_failed(ConnectionErrorKind::Io, "rig:1023");
        let protocol = DoserError::protocol("control packet", "bad token");

        assert!(refused.is_retryable());
        assert!(!io.is_retryable());
        assert!(!protocol.is_retryable());

        for error in [refused, io, protocol, DoserError::NotConnected] {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty());
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }
}
