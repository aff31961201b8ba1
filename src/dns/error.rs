//! Error types for the DNS engine
//!
//! Errors are grouped by where they happen: decoding or encoding a message,
//! talking to a recursor, resolving a name locally, or running a server.
//!
//! # Example
//!
//! ```
//! use kwt_net::dns::DnsError;
//!
//! let err = DnsError::timeout("query to 8.8.8.8:53", std::time::Duration::from_secs(5));
//! assert!(err.is_recoverable());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error types for DNS operations
///
/// # Recoverability
///
/// - **Recoverable**: transient issues that may succeed against another
///   recursor or on retry (timeouts, network errors)
/// - **Non-recoverable**: malformed input or broken local state
#[derive(Debug, Error)]
pub enum DnsError {
    /// A received DNS message could not be decoded
    #[error("Failed to parse DNS message: {reason}")]
    ParseError {
        /// Description of what went wrong during parsing
        reason: String,
    },

    /// A DNS message could not be encoded for transmission
    #[error("Failed to serialize DNS message: {reason}")]
    SerializeError {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// Socket level failure
    #[error("Network error: {reason}")]
    NetworkError {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// No reply within the exchange deadline
    #[error("DNS query timed out after {timeout:?}: {context}")]
    TimeoutError {
        /// Description of what timed out
        context: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// Every recursor in the pool failed
    #[error("{reason}")]
    NoUpstream {
        /// Aggregate failure description
        reason: String,
    },

    /// A locally authoritative name could not be resolved
    #[error("Resolving '{name}': {reason}")]
    ResolveError {
        /// The question name
        name: String,
        /// Why resolution failed
        reason: String,
    },

    /// Invalid DNS engine configuration
    #[error("Invalid DNS configuration: {reason}")]
    ConfigError {
        /// Description of the configuration error
        reason: String,
    },

    /// Unexpected internal state
    #[error("Internal DNS error: {reason}")]
    InternalError {
        /// Description of the internal error
        reason: String,
    },
}

impl DnsError {
    // ========================================================================
    // Constructor methods
    // ========================================================================

    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a serialize error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::SerializeError {
            reason: reason.into(),
        }
    }

    /// Create a network error without an underlying I/O error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error wrapping an I/O error
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::TimeoutError {
            context: context.into(),
            timeout,
        }
    }

    /// Create the aggregate "all recursors failed" error
    pub fn no_upstream(reason: impl Into<String>) -> Self {
        Self::NoUpstream {
            reason: reason.into(),
        }
    }

    /// Create a resolution error for a locally authoritative name
    pub fn resolve(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResolveError {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError {
            reason: reason.into(),
        }
    }

    // ========================================================================
    // Classification
    // ========================================================================

    /// Check if this error is worth retrying, possibly against another recursor
    ///
    /// ```
    /// use kwt_net::dns::DnsError;
    /// use std::time::Duration;
    ///
    /// assert!(DnsError::timeout("query", Duration::from_secs(5)).is_recoverable());
    /// assert!(!DnsError::config("invalid address").is_recoverable());
    /// ```
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NetworkError { source, .. } => source.as_ref().map_or(true, |e| {
                matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionRefused
                )
            }),
            Self::TimeoutError { .. } => true,
            Self::ParseError { .. }
            | Self::SerializeError { .. }
            | Self::NoUpstream { .. }
            | Self::ResolveError { .. }
            | Self::ConfigError { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Check if this error indicates a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }

    /// Get the question name of a resolution error
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        match self {
            Self::ResolveError { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        Self::NetworkError {
            reason: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        Self::parse(err.to_string())
    }
}

/// Type alias for Result with [`DnsError`]
pub type DnsResult<T> = std::result::Result<T, DnsError>;
