//! Error types for the PostgreSQL protocol implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::Location;
use std::sync::Arc;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Transport and lifecycle failures of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionCode {
    /// The connection was torn down while work was outstanding.
    Destroyed,
    /// The handshake did not finish within `connect_timeout`.
    ConnectTimeout,
    /// The transport closed underneath an in-flight query.
    Closed,
    /// The pool or connection is ending and accepts no new work.
    Ended,
}

impl ConnectionCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionCode::Destroyed => "CONNECTION_DESTROYED",
            ConnectionCode::ConnectTimeout => "CONNECT_TIMEOUT",
            ConnectionCode::Closed => "CONNECTION_CLOSED",
            ConnectionCode::Ended => "CONNECTION_ENDED",
        }
    }
}

impl fmt::Display for ConnectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-detected misuse or client-side aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenericCode {
    MaxParametersExceeded,
    SaslSignatureMismatch,
    /// Uses the server's SQLSTATE for a cancelled statement.
    QueryCancelled,
    UnsafeTransaction,
    CopyFailed,
}

impl GenericCode {
    pub fn as_str(self) -> &'static str {
        match self {
            GenericCode::MaxParametersExceeded => "MAX_PARAMETERS_EXCEEDED",
            GenericCode::SaslSignatureMismatch => "SASL_SIGNATURE_MISMATCH",
            GenericCode::QueryCancelled => "57014",
            GenericCode::UnsafeTransaction => "UNSAFE_TRANSACTION",
            GenericCode::CopyFailed => "COPY_FAILED",
        }
    }
}

impl fmt::Display for GenericCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured ErrorResponse (or NoticeResponse) from the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub severity_nonlocalized: Option<String>,
    /// SQLSTATE code, e.g. `22012`.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub internal_position: Option<u32>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
    /// Where the failing query was built in the caller's code.
    pub origin: Option<&'static Location<'static>>,
}

impl ServerError {
    /// Map the single-byte field tags of an ErrorResponse onto named fields.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        let text = |tag: u8| fields.get(&tag).cloned();
        let number = |tag: u8| fields.get(&tag).and_then(|v| v.parse().ok());

        Self {
            severity: text(b'S').unwrap_or_default(),
            severity_nonlocalized: text(b'V'),
            code: text(b'C').unwrap_or_default(),
            message: text(b'M').unwrap_or_default(),
            detail: text(b'D'),
            hint: text(b'H'),
            position: number(b'P'),
            internal_position: number(b'p'),
            internal_query: text(b'q'),
            where_: text(b'W'),
            schema: text(b's'),
            table: text(b't'),
            column: text(b'c'),
            data_type: text(b'd'),
            constraint: text(b'n'),
            file: text(b'F'),
            line: number(b'L'),
            routine: text(b'R'),
            origin: None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        if let Some(origin) = self.origin {
            write!(f, "\nQuery built at {}", origin)?;
        }
        Ok(())
    }
}

/// Errors that can occur during PostgreSQL operations.
///
/// Cloneable because a single transport failure rejects every query that
/// was queued on the connection.
#[derive(Debug, Clone, Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server asked for an authentication method we do not speak.
    #[error("AUTH_TYPE_NOT_IMPLEMENTED: {0} authentication is not implemented")]
    AuthNotImplemented(String),

    /// Transport or lifecycle failure.
    #[error("{code}: {address}")]
    Connection { code: ConnectionCode, address: String },

    /// Server returned an error.
    #[error("{0}")]
    Server(Box<ServerError>),

    /// A backend message this engine deliberately does not handle.
    #[error("{0} is not supported")]
    NotSupported(String),

    /// Client-detected misuse.
    #[error("{code}: {message}")]
    Generic { code: GenericCode, message: String },

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),
}

impl PgError {
    pub fn connection(code: ConnectionCode, address: impl Into<String>) -> Self {
        PgError::Connection {
            code,
            address: address.into(),
        }
    }

    pub fn generic(code: GenericCode, message: impl Into<String>) -> Self {
        PgError::Generic {
            code,
            message: message.into(),
        }
    }

    /// SQLSTATE for server errors, the canonical code string otherwise.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server(e) => Some(&e.code),
            PgError::Connection { code, .. } => Some(code.as_str()),
            PgError::Generic { code, .. } => Some(code.as_str()),
            PgError::AuthNotImplemented(_) => Some("AUTH_TYPE_NOT_IMPLEMENTED"),
            _ => None,
        }
    }

    pub fn server(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Server-side routine that raised the error, if reported.
    pub fn routine(&self) -> Option<&str> {
        self.server().and_then(|e| e.routine.as_deref())
    }

    /// Whether the error means the transport is gone.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, PgError::Io(_) | PgError::Connection { .. })
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(Arc::new(e))
    }
}

impl From<ServerError> for PgError {
    fn from(e: ServerError) -> Self {
        PgError::Server(Box::new(e))
    }
}
