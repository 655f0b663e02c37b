//! Error taxonomy.
//!
//! Every fallible call returns [`Result`]. Whether an error leaves the
//! connection usable is answered by [`Error::is_fatal`]: protocol and I/O
//! failures poison the byte stream, server ERR packets and usage errors do
//! not.

use std::fmt;

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, authentication, disconnect)
    Connection(ConnectionError),
    /// Errors reported by the server in an ERR packet
    Query(QueryError),
    /// Type conversion errors while binding row values
    Type(TypeError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// Caller misuse detected before or without touching the wire
    Usage(UsageError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    /// Server ERR packet that caused this error, if any.
    pub server_error: Option<ServerErrorInfo>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// The server requested an authentication method we cannot perform
    UnsupportedAuthMethod,
    /// Connection lost, or unusable after a fatal error
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    Refused,
}

/// Code, SQLSTATE and message of a server ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerErrorInfo {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Server error code (e.g. 1062 for duplicate entry).
    pub code: u16,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
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
    /// Data too large for column
    DataTruncation,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub kind: TypeErrorKind,
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeErrorKind {
    /// Value kind cannot be converted into the requested type
    Mismatch,
    /// SQL NULL bound to a non-optional destination
    UnexpectedNull,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Packet sequence number did not match the expected value
    Desync,
    /// Packet could not be decoded
    Malformed,
    /// Temporal value with an invalid wire length or field range
    InvalidTemporalEncoding,
    /// Well-formed packet that is not valid at this point of the exchange
    UnexpectedPacket,
}

#[derive(Debug)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// Number of bound parameters differs from the statement's parameter count
    ParameterCountMismatch,
    /// Number of scan destinations differs from the column count
    ArityMismatch,
    /// A command was issued while a result set is still open
    ResultSetNotDrained,
    /// The statement handle was closed or belongs to another connection
    StatementClosed,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Server errors that may succeed when the statement is run again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Is this a connection-level failure rather than a statement failure?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// Does this error leave the byte stream in an unknown state?
    ///
    /// A connection that produced a fatal error must not be used again.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Protocol(_) | Error::Io(_) => true,
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Disconnected | ConnectionErrorKind::Ssl
            ),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for integrity violations)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Connection(c) => c.server_error.as_ref().map(|e| e.sql_state.as_str()),
            _ => None,
        }
    }

    /// Get the server error code if this error came from an ERR packet.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => Some(q.code),
            Error::Connection(c) => c.server_error.as_ref().map(|e| e.code),
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

    /// Protocol error kind, if this is a protocol error.
    pub fn protocol_kind(&self) -> Option<ProtocolErrorKind> {
        match self {
            Error::Protocol(p) => Some(p.kind),
            _ => None,
        }
    }

    /// Usage error kind, if this is a usage error.
    pub fn usage_kind(&self) -> Option<UsageErrorKind> {
        match self {
            Error::Usage(u) => Some(u.kind),
            _ => None,
        }
    }

    /// Connection error kind, if this is a connection error.
    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Error::Connection(c) => Some(c.kind),
            _ => None,
        }
    }

    /// Type error kind, if this is a type error.
    pub fn type_kind(&self) -> Option<TypeErrorKind> {
        match self {
            Error::Type(t) => Some(t.kind),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a duplicate key / unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.code == 1062 || self.code == 1586
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, 1216 | 1217 | 1451 | 1452)
    }
}

impl UsageError {
    pub fn new(kind: UsageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raw_data: None,
            source: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

fn boxed_source(
    source: &Option<Box<dyn std::error::Error + Send + Sync>>,
) -> Option<&(dyn std::error::Error + 'static)> {
    source
        .as_deref()
        .map(|err| err as &(dyn std::error::Error + 'static))
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => boxed_source(&e.source),
            Error::Query(e) => boxed_source(&e.source),
            Error::Protocol(e) => boxed_source(&e.source),
            Error::Config(e) => boxed_source(&e.source),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server_error {
            Some(server) => write!(
                f,
                "{} ({} [{}]: {})",
                self.message, server.code, server.sql_state, server.message
            ),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} ({}, SQLSTATE {})", self.message, self.code, sqlstate)
        } else {
            write!(f, "{} ({})", self.message, self.code)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.column) {
            (TypeErrorKind::UnexpectedNull, Some(col)) => {
                write!(f, "unexpected NULL in column '{}' for {}", col, self.expected)
            }
            (TypeErrorKind::UnexpectedNull, None) => {
                write!(f, "unexpected NULL for {}", self.expected)
            }
            (TypeErrorKind::Mismatch, Some(col)) => write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            ),
            (TypeErrorKind::Mismatch, None) => {
                write!(f, "expected {}, found {}", self.expected, self.actual)
            }
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

macro_rules! error_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Error::$variant(err)
                }
            }
        )+
    };
}

error_from! {
    std::io::Error => Io,
    ConnectionError => Connection,
    QueryError => Query,
    TypeError => Type,
    ProtocolError => Protocol,
    UsageError => Usage,
    ConfigError => Config,
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;
