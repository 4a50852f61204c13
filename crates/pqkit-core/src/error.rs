//! Error types for pqkit operations.
//!
//! Errors fall into four families that callers are expected to treat
//! differently:
//!
//! - **usage** ([`Error::Usage`]): the caller broke an invariant that can be
//!   checked locally (starting a second transaction, executing a spent
//!   invocation, binding the wrong number of arguments). Detected before any
//!   round-trip and never retried.
//! - **runtime** ([`Error::Query`], [`Error::Connection`],
//!   [`Error::LargeObject`], [`Error::Transaction`], [`Error::Unsupported`]):
//!   the server or the wrapped protocol reported a failure. The protocol's
//!   reason string is attached.
//! - **internal** ([`Error::Internal`]): something that should be
//!   structurally impossible happened; a defect in this library.
//! - **resource exhaustion** ([`Error::OutOfMemory`]): split out so callers
//!   can apply backoff.

use std::fmt;

/// The primary error type for all pqkit operations.
#[derive(Debug)]
pub enum Error {
    /// The caller violated a locally checkable invariant
    Usage(UsageError),
    /// Query execution failed on the server
    Query(QueryError),
    /// Connection-related errors (connect, lost connection, reset)
    Connection(ConnectionError),
    /// A large-object call failed
    LargeObject(LargeObjectError),
    /// Transaction ended in a broken or in-doubt state
    Transaction(TransactionError),
    /// A defect in this library
    Internal(InternalError),
    /// Memory could not be allocated, here or in the wrapped library
    OutOfMemory(String),
    /// The server or client library lacks a required capability
    Unsupported(String),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct UsageError {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct InternalError {
    pub message: String,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Reconnecting failed
    Reset,
    /// Cancel request could not be delivered
    Cancel,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Cancelled through a cancel request
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug, Clone)]
pub struct LargeObjectError {
    /// Object the call was made on, if one was selected
    pub oid: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The transaction (or its connection) is in an inconsistent state
    Broken,
    /// The connection was lost while committing; the outcome is unknown
    InDoubt,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            message: message.into(),
        })
    }

    /// Build an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(InternalError {
            message: message.into(),
        })
    }

    /// Build a transaction error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Build a connection error without an underlying source.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a query error carrying only a message.
    pub fn query(kind: QueryErrorKind, sql: Option<&str>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: sql.map(str::to_string),
            sqlstate: None,
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
        })
    }

    /// Build a large-object error.
    pub fn large_object(oid: Option<u32>, message: impl Into<String>) -> Self {
        Error::LargeObject(LargeObjectError {
            oid,
            message: message.into(),
        })
    }

    /// Did the caller misuse the API?
    pub fn is_usage(&self) -> bool {
        matches!(self, Error::Usage(_))
    }

    /// Is this a defect in the library itself?
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }

    /// Did the server or the wrapped protocol report the failure?
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Error::Query(_)
                | Error::Connection(_)
                | Error::LargeObject(_)
                | Error::Transaction(_)
                | Error::Unsupported(_)
                | Error::Io(_)
        )
    }

    /// Is this a retryable error (out of memory, deadlock, serialization, timeouts)?
    ///
    /// In-doubt commits are deliberately not retryable: the first attempt may
    /// have succeeded.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::OutOfMemory(_) => true,
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Is this a connection error that likely requires a reset?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => !matches!(c.kind, ConnectionErrorKind::Cancel),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::LargeObject(e) => write!(f, "Large object error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e),
            Error::Internal(e) => write!(
                f,
                "Internal error: {} (this is a bug in pqkit, please report it)",
                e.message
            ),
            Error::OutOfMemory(msg) => write!(f, "Out of memory: {}", msg),
            Error::Unsupported(msg) => write!(f, "Feature not supported: {}", msg),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for InternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for LargeObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransactionErrorKind::Broken => write!(f, "{}", self.message),
            TransactionErrorKind::InDoubt => write!(f, "outcome unknown: {}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<InternalError> for Error {
    fn from(err: InternalError) -> Self {
        Error::Internal(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<LargeObjectError> for Error {
    fn from(err: LargeObjectError) -> Self {
        Error::LargeObject(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for pqkit operations.
pub type Result<T> = std::result::Result<T, Error>;
