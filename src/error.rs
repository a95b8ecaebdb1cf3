//! Error types
//!
//! Setup failures (`Config`, `Connect`, `IdentityResolution`) abort connection
//! construction. Once a connection is live, callers only ever see `Cancelled`
//! or one of the transport variants passed through from the backend.
//! [`KillError`] is diagnostic-only and never converts into [`Error`].

use crate::context::CancelReason;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Server-reported error fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    /// Severity (ERROR, FATAL, PANIC, ...)
    pub severity: Option<String>,
    /// SQLSTATE or vendor error code
    pub code: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// Additional detail
    pub detail: Option<String>,
    /// Hint
    pub hint: Option<String>,
}

impl ServerError {
    /// Create a server error from a bare message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Attach an error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// True when the server will close the session after reporting this error
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_deref(), Some("FATAL") | Some("PANIC"))
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(ref msg) => write!(f, "{}", msg)?,
            None => write!(f, "unknown server error")?,
        }
        if let Some(ref code) = self.code {
            write!(f, " ({})", code)?;
        }
        Ok(())
    }
}

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed DSN or options
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport refused to connect or to build a connector
    #[error("connect error: {0}")]
    Connect(String),

    /// The server session identity could not be determined
    #[error("could not resolve session identity: {0}")]
    IdentityResolution(String),

    /// The operation's context fired before the call returned
    #[error("operation {0}")]
    Cancelled(CancelReason),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Wire protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error reported by the server
    #[error("server error: {0}")]
    Server(ServerError),

    /// Authentication failure
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Connection closed by peer or after a fatal error
    #[error("connection closed")]
    ConnectionClosed,

    /// Connection is already running a call
    #[error("connection busy: {0}")]
    ConnectionBusy(String),

    /// Invalid state transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },
}

impl Error {
    /// True when this error reports a fired context
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Cancellation reason, if this is a cancellation
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Error::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }

    /// True when the physical connection can no longer be used
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Io(_) | Error::Protocol(_) | Error::ConnectionClosed => true,
            Error::Server(fields) => fields.is_fatal(),
            _ => false,
        }
    }

    /// Get error category for observability
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Connect(_) => "connect",
            Error::IdentityResolution(_) => "identity",
            Error::Cancelled(_) => "cancelled",
            Error::Io(_) => "io",
            Error::Protocol(_) => "protocol",
            Error::Server(_) => "server",
            Error::Authentication(_) => "authentication",
            Error::ConnectionClosed => "connection_closed",
            Error::ConnectionBusy(_) => "connection_busy",
            Error::InvalidState { .. } => "invalid_state",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of an out-of-band kill command
///
/// Reported through logs and metrics only. A `KillError` never replaces the
/// `Cancelled` error already delivered to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KillError {
    /// Every kill connection stayed busy for the whole kill timeout
    #[error("kill pool exhausted: {size} connection(s) busy for {timeout:?}")]
    PoolExhausted {
        /// Configured pool size
        size: usize,
        /// Time spent waiting
        timeout: Duration,
    },

    /// The kill command did not finish within the kill timeout
    #[error("kill of session {target} timed out after {timeout:?}")]
    Timeout {
        /// Session being killed
        target: String,
        /// Configured kill timeout
        timeout: Duration,
    },

    /// Opening an administrative connection failed
    #[error("kill connection failed: {0}")]
    Connect(String),

    /// The server rejected the kill command
    #[error("kill command failed: {0}")]
    Command(String),

    /// The server ran the command but reported no session was affected
    #[error("session {target} was not killed (already gone?)")]
    NotAcknowledged {
        /// Session being killed
        target: String,
    },

    /// The session identity cannot be rendered into a kill command
    #[error("invalid kill target: {0}")]
    InvalidTarget(String),
}

impl KillError {
    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            KillError::PoolExhausted { .. } => "pool_exhausted",
            KillError::Timeout { .. } => "timeout",
            KillError::Connect(_) => "connect",
            KillError::Command(_) => "command",
            KillError::NotAcknowledged { .. } => "not_acknowledged",
            KillError::InvalidTarget(_) => "invalid_target",
        }
    }
}
