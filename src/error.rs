//! Error types for kwt-net
//!
//! This module defines the error hierarchy for the forwarding engine.
//! Errors are categorized by subsystem and include recovery hints.
//! DNS errors live in [`crate::dns::DnsError`] and are wrapped here.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::dns::DnsError;

/// Top-level error type for kwt-net
#[derive(Debug, Error)]
pub enum KwtNetError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Redirection rule installation and removal errors
    #[error("Forwarder error: {0}")]
    Forwarder(#[from] ForwarderError),

    /// Original destination lookup errors
    #[error("Original destination error: {0}")]
    OrigDst(#[from] OrigDstError),

    /// Tunnel transport errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// TCP/UDP proxy errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// DNS engine errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Session orchestration errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl KwtNetError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Session(_) => false,
            Self::Forwarder(e) => e.is_recoverable(),
            Self::OrigDst(e) => e.is_recoverable(),
            Self::Tunnel(e) => e.is_recoverable(),
            Self::Proxy(e) => e.is_recoverable(),
            Self::Dns(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
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

/// Redirection driver errors
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// An external firewall command exited unsuccessfully
    #[error("Running '{command}': {reason}")]
    Command { command: String, reason: String },

    /// The firewall tool is missing or unusable
    #[error("Prerequisite check for {tool} failed: {reason}")]
    Prerequisite { tool: String, reason: String },

    /// No redirection driver exists for this OS
    #[error("Unsupported OS '{0}'")]
    UnsupportedOs(String),

    /// No forwarder was installed yet
    #[error("Forwarder is not initialized")]
    NotInitialized,

    /// Packet filter device errors (macOS)
    #[error(transparent)]
    Pf(#[from] PfError),

    /// Several cleanup steps failed
    #[error("Multiple errors: {}", .0.join(", "))]
    Multiple(Vec<String>),

    /// I/O error spawning a command
    #[error("Forwarder I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ForwarderError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Command { .. } | Self::Multiple(_) => true,
            Self::Prerequisite { .. } | Self::UnsupportedOs(_) | Self::NotInitialized => false,
            Self::Pf(e) => e.is_recoverable(),
            Self::IoError(e) => matches!(e.kind(), io::ErrorKind::Interrupted),
        }
    }

    /// Create a command error
    pub fn command(cmd: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command {
            command: cmd.into(),
            reason: reason.into(),
        }
    }

    /// Create a prerequisite error
    pub fn prerequisite(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Prerequisite {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Collapse accumulated cleanup errors into one result
    ///
    /// # Errors
    ///
    /// Returns the single error unchanged, or [`ForwarderError::Multiple`]
    /// when more than one step failed.
    pub fn from_many(mut errors: Vec<Self>) -> std::result::Result<(), Self> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(
                errors.iter().map(ToString::to_string).collect(),
            )),
        }
    }
}

/// Packet filter (`/dev/pf`) errors
#[derive(Debug, Error)]
pub enum PfError {
    /// Failed to open the pf device
    #[error("Opening {path}: {reason}")]
    Open { path: String, reason: String },

    /// An ioctl call failed
    #[error("ioctl {request}: {reason}")]
    Ioctl { request: &'static str, reason: String },

    /// Native struct size does not match the kernel ABI
    #[error("Expected {name} to be {expected} bytes but was {actual}")]
    LayoutMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Anchor name does not fit into the fixed-size field
    #[error("Anchor name '{0}' is too long")]
    NameTooLong(String),

    /// Packet filter is only available on macOS
    #[error("Packet filter is not supported on this OS")]
    Unsupported,
}

impl PfError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Ioctl { .. })
    }

    /// Create an ioctl error from the last OS error
    pub fn ioctl(request: &'static str, err: &io::Error) -> Self {
        Self::Ioctl {
            request,
            reason: err.to_string(),
        }
    }
}

/// Original destination lookup errors
#[derive(Debug, Error)]
pub enum OrigDstError {
    /// Socket option lookup failed
    #[error("Failed to get socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// The connection was not redirected by a NAT rule
    #[error("Connection from {peer} was not redirected")]
    NotRedirected { peer: SocketAddr },

    /// Address family is not supported
    #[error("Unsupported address family: {0}")]
    UnsupportedFamily(String),

    /// pf NAT lookup failed
    #[error(transparent)]
    Pf(#[from] PfError),

    /// I/O error
    #[error("Original destination I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl OrigDstError {
    /// Check if this error is recoverable
    ///
    /// A failed lookup only affects one connection, so most variants are.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::UnsupportedFamily(_))
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Tunnel transport errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Could not reach the remote entry point
    #[error("Connecting to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Authentication was rejected
    #[error("Authenticating as '{user}': {reason}")]
    Auth { user: String, reason: String },

    /// Private or public key could not be parsed
    #[error("Parsing key: {0}")]
    Key(String),

    /// Dialing a destination through the tunnel failed
    #[error("Dialing {addr}: {reason}")]
    Dial { addr: String, reason: String },

    /// Creating a remote listener failed
    #[error("Listening on {addr}: {reason}")]
    Listen { addr: String, reason: String },

    /// The underlying session is gone (EOF, broken pipe, reset)
    #[error("Connection broken: {0}")]
    ConnectionBroken(String),

    /// Entry point could not produce a session
    #[error("Entry point: {0}")]
    EntryPoint(String),

    /// Listener was closed by the caller
    #[error("Listener closed")]
    Closed,

    /// I/O error
    #[error("Tunnel I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Dial { .. } | Self::Listen { .. } => true,
            Self::ConnectionBroken(_) => true,
            Self::Auth { .. } | Self::Key(_) | Self::EntryPoint(_) | Self::Closed => false,
            Self::IoError(e) => is_broken_io(e),
        }
    }

    /// Check if the session behind this error is dead and should be rebuilt
    #[must_use]
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Self::ConnectionBroken(_) => true,
            Self::IoError(e) => is_broken_io(e),
            _ => false,
        }
    }

    /// Create a dial error
    pub fn dial(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dial {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Create a listen error
    pub fn listen(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Listen {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Create a connect error
    pub fn connect(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connect {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// I/O error kinds that mean the peer went away
pub(crate) fn is_broken_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// TCP/UDP proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the local listener
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Accept loop failed
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// I/O error
    #[error("Proxy I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::AcceptError(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Session orchestration errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Neither configured nor guessed subnets were found
    #[error("Expected at least one subnet to be guessed or specified")]
    NoSubnets,

    /// A subordinate component failed while running
    #[error("{component}: {reason}")]
    Component { component: &'static str, reason: String },

    /// Teardown steps failed
    #[error("Teardown: {}", .0.join(", "))]
    Teardown(Vec<String>),
}

impl SessionError {
    /// Create a component failure
    pub fn component(component: &'static str, reason: impl ToString) -> Self {
        Self::Component {
            component,
            reason: reason.to_string(),
        }
    }
}

/// Type alias for Result with [`KwtNetError`]
pub type Result<T> = std::result::Result<T, KwtNetError>;
