//! Error types for wg-intercept
//!
//! Every failure that can reach an application socket call is an
//! [`InterceptError`]. Converting one into [`io::Error`] yields the raw OS
//! error a real socket call would report in the same situation, so callers
//! above the interception layer only ever see errno values they already
//! handle.

use std::io;

use thiserror::Error;

/// Top-level error type for the interception layer
#[derive(Debug, Error)]
pub enum InterceptError {
    /// Error from the real OS call on a passthrough socket, kept verbatim
    #[error("{0}")]
    Passthrough(#[from] io::Error),

    /// The tunnel cipher rejected or failed to produce a datagram
    #[error("Tunnel encapsulation failed: {0}")]
    TunnelEncapsulation(String),

    /// An inbound datagram failed authentication or decoding
    #[error("Tunnel decapsulation failed: {0}")]
    TunnelDecapsulation(String),

    /// Virtual TCP connect got no answer in time
    #[error("Virtual connection timed out")]
    VirtualConnectionTimeout,

    /// The peer reset an established virtual TCP connection, or our
    /// retransmissions went unanswered
    #[error("Virtual connection reset by peer")]
    VirtualConnectionReset,

    /// The peer answered a virtual TCP connect with a reset
    #[error("Virtual connection refused")]
    VirtualConnectionRefused,

    /// The handle was closed while the call was in progress
    #[error("Socket closed")]
    SocketClosed,

    /// Non-blocking call would have to wait
    #[error("Operation would block")]
    WouldBlock,

    /// Non-blocking connect has started but not finished
    #[error("Operation in progress")]
    InProgress,

    /// Stream operation on a connection that is not established
    #[error("Socket is not connected")]
    NotConnected,

    /// Write after the local side already sent its FIN
    #[error("Broken pipe")]
    BrokenPipe,

    /// Datagram does not fit in a single tunnel packet
    #[error("Message too large: {size} bytes")]
    MessageTooLarge { size: usize },

    /// The tunnel session is shut down or could not be started
    #[error("Tunnel unavailable: {0}")]
    TunnelUnavailable(String),

    /// No local port left for a virtual TCP connection
    #[error("No local port available for virtual connection")]
    PortsExhausted,

    /// Invalid WireGuard key material
    #[error("Key error: {0}")]
    Key(String),

    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl InterceptError {
    /// The errno a real socket call would report for this failure
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Passthrough(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::TunnelEncapsulation(_) => libc::ENOBUFS,
            Self::TunnelDecapsulation(_) => libc::EIO,
            Self::VirtualConnectionTimeout => libc::ETIMEDOUT,
            Self::VirtualConnectionReset => libc::ECONNRESET,
            Self::VirtualConnectionRefused => libc::ECONNREFUSED,
            Self::SocketClosed => libc::EBADF,
            Self::WouldBlock => libc::EAGAIN,
            Self::InProgress => libc::EINPROGRESS,
            Self::NotConnected => libc::ENOTCONN,
            Self::BrokenPipe => libc::EPIPE,
            Self::MessageTooLarge { .. } => libc::EMSGSIZE,
            Self::TunnelUnavailable(_) => libc::ENETUNREACH,
            Self::PortsExhausted => libc::EADDRNOTAVAIL,
            Self::Key(_) | Self::Config(_) => libc::EINVAL,
        }
    }

    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Passthrough(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            Self::TunnelEncapsulation(_)
            | Self::TunnelDecapsulation(_)
            | Self::WouldBlock
            | Self::InProgress
            | Self::TunnelUnavailable(_) => true,
            Self::VirtualConnectionTimeout
            | Self::VirtualConnectionReset
            | Self::VirtualConnectionRefused
            | Self::SocketClosed
            | Self::NotConnected
            | Self::BrokenPipe
            | Self::MessageTooLarge { .. }
            | Self::PortsExhausted
            | Self::Key(_)
            | Self::Config(_) => false,
        }
    }
}

impl From<InterceptError> for io::Error {
    fn from(err: InterceptError) -> Self {
        match err {
            // Keep the original error object (custom kinds, messages) intact
            InterceptError::Passthrough(e) => e,
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}
