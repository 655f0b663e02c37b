//! MySQL wire protocol implementation.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum packet payload is 2^24 - 1 (16MB - 1). Larger payloads
//! are split into multiple packets.

#![allow(clippy::cast_possible_truncation)]

pub mod framer;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use framer::{PacketFramer, Transport, split_into_packets};
pub use prepared::{
    Statement, StmtPrepareOk, build_stmt_close_packet, build_stmt_execute_packet, build_stmt_prepare_packet,
    build_stmt_reset_packet, parse_stmt_prepare_ok,
};
pub use reader::PacketReader;
pub use writer::PacketWriter;

use sqlwire_core::error::{
    ConnectionError, ConnectionErrorKind, ProtocolError, ProtocolErrorKind, QueryError,
    QueryErrorKind, ServerErrorInfo, UsageError, UsageErrorKind,
};
use sqlwire_core::{Error, Result};

/// Maximum payload size for a single MySQL packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;
    pub const CLIENT_OPTIONAL_RESULTSET_METADATA: u32 = 1 << 25;
    pub const CLIENT_ZSTD_COMPRESSION_ALGORITHM: u32 = 1 << 26;
    pub const CLIENT_QUERY_ATTRIBUTES: u32 = 1 << 27;

    /// Capabilities offered by default; one command yields one result set.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_DEPRECATE_EOF;
}

/// Command opcodes issued by this engine (COM_xxx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Text protocol query
    Query = 0x03,
    /// Ping server
    Ping = 0x0e,
    /// Prepare statement
    StmtPrepare = 0x16,
    /// Execute prepared statement
    StmtExecute = 0x17,
    /// Close prepared statement
    StmtClose = 0x19,
    /// Reset prepared statement
    StmtReset = 0x1a,
}

/// Server status bits carried by OK and EOF packets.
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
}

pub mod charset {
    /// Binary collation; string columns with it hold raw bytes.
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_0900_AI_CI;
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Info string (if any)
    pub info: String,
}

/// Parsed Error packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl ErrPacket {
    /// Check if this is a unique constraint violation.
    pub fn is_duplicate_key(&self) -> bool {
        // ER_DUP_ENTRY, ER_DUP_ENTRY_WITH_KEY_NAME
        matches!(self.error_code, 1062 | 1586)
    }

    /// Check if this is a foreign key constraint violation.
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.error_code, 1216 | 1217 | 1451 | 1452)
    }

    /// Classify the server error code.
    pub fn kind(&self) -> QueryErrorKind {
        if self.is_duplicate_key() || self.is_foreign_key_violation() {
            return QueryErrorKind::Constraint;
        }
        match self.error_code {
            1048 | 1364 => QueryErrorKind::Constraint,
            1064 | 1149 => QueryErrorKind::Syntax,
            1049 | 1054 | 1146 => QueryErrorKind::NotFound,
            1044 | 1045 | 1142 | 1143 => QueryErrorKind::Permission,
            1264 | 1406 => QueryErrorKind::DataTruncation,
            1213 => QueryErrorKind::Deadlock,
            1205 | 3024 => QueryErrorKind::Timeout,
            _ => QueryErrorKind::Database,
        }
    }

    pub fn server_info(&self) -> ServerErrorInfo {
        ServerErrorInfo {
            code: self.error_code,
            sql_state: self.sql_state.clone(),
            message: self.error_message.clone(),
        }
    }

    /// Convert into the `ServerError` surfaced to callers.
    pub fn into_error(self, sql: Option<&str>) -> Error {
        Error::Query(QueryError {
            kind: self.kind(),
            code: self.error_code,
            sql: sql.map(str::to_string),
            sqlstate: (!self.sql_state.is_empty()).then_some(self.sql_state),
            message: self.error_message,
            source: None,
        })
    }
}

/// Parsed EOF packet (deprecated in newer MySQL versions).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}

/// A decoded server response to a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// 0x00 header: command succeeded without rows
    Ok(OkPacket),
    /// 0xFF header: command failed
    Err(ErrPacket),
    /// 0xFE header with a short payload
    Eof(EofPacket),
    /// A result set follows with this many columns
    ResultSet { column_count: u64 },
    /// 0xFB header: server asks for a local file
    LocalInfile { filename: String },
}

/// Decode the first packet of a server response.
///
/// Under `CLIENT_DEPRECATE_EOF` a short 0xFE packet carries OK fields and is
/// returned as `Response::Ok`.
#[allow(clippy::result_large_err)]
pub fn decode_response(payload: &[u8], caps: u32) -> Result<Response> {
    let session_track = caps & capabilities::CLIENT_SESSION_TRACK != 0;
    let Some(&first) = payload.first() else {
        return Err(malformed("empty response packet"));
    };
    let mut reader = PacketReader::new(payload);
    match first {
        0x00 => reader
            .parse_ok_packet(session_track)
            .map(Response::Ok)
            .ok_or_else(|| malformed_with("truncated OK packet", payload)),
        0xFF => reader
            .parse_err_packet()
            .map(Response::Err)
            .ok_or_else(|| malformed_with("truncated ERR packet", payload)),
        0xFE if payload.len() < 9 => {
            if caps & capabilities::CLIENT_DEPRECATE_EOF != 0 {
                reader
                    .parse_ok_packet(session_track)
                    .map(Response::Ok)
                    .ok_or_else(|| malformed_with("truncated OK packet", payload))
            } else {
                reader
                    .parse_eof_packet()
                    .map(Response::Eof)
                    .ok_or_else(|| malformed_with("truncated EOF packet", payload))
            }
        }
        0xFB => {
            reader.skip(1);
            Ok(Response::LocalInfile {
                filename: reader.read_rest_string(),
            })
        }
        _ => match reader.read_lenenc_int() {
            Some(column_count) if column_count > 0 => Ok(Response::ResultSet { column_count }),
            _ => Err(malformed_with("invalid result set header", payload)),
        },
    }
}

/// Does this payload end a run of rows or column definitions?
///
/// Without `CLIENT_DEPRECATE_EOF` the terminator is an EOF packet (0xFE,
/// under 9 bytes). With it, the terminator is an OK packet with a 0xFE
/// header, which may carry an info string; a row can only start with 0xFE
/// when its first value is at least 16MB long.
pub fn is_terminator(payload: &[u8], caps: u32) -> bool {
    if payload.first() != Some(&0xFE) {
        return false;
    }
    if caps & capabilities::CLIENT_DEPRECATE_EOF != 0 {
        payload.len() < MAX_PACKET_SIZE
    } else {
        payload.len() < 9
    }
}

/// Terminal status of a result set: OK-as-EOF or classic EOF.
#[allow(clippy::result_large_err)]
pub fn decode_terminator(payload: &[u8], caps: u32) -> Result<OkPacket> {
    let mut reader = PacketReader::new(payload);
    if caps & capabilities::CLIENT_DEPRECATE_EOF != 0 {
        let session_track = caps & capabilities::CLIENT_SESSION_TRACK != 0;
        reader
            .parse_ok_packet(session_track)
            .ok_or_else(|| malformed_with("truncated OK terminator", payload))
    } else {
        let eof = reader
            .parse_eof_packet()
            .ok_or_else(|| malformed_with("truncated EOF packet", payload))?;
        Ok(OkPacket {
            status_flags: eof.status_flags,
            warnings: eof.warnings,
            ..OkPacket::default()
        })
    }
}

pub(crate) fn protocol_error(kind: ProtocolErrorKind, msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError::new(kind, msg))
}

pub(crate) fn malformed(msg: impl Into<String>) -> Error {
    protocol_error(ProtocolErrorKind::Malformed, msg)
}

pub(crate) fn malformed_with(msg: impl Into<String>, raw: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        kind: ProtocolErrorKind::Malformed,
        message: msg.into(),
        raw_data: Some(raw.iter().copied().take(64).collect()),
        source: None,
    })
}

pub(crate) fn unexpected_packet(msg: impl Into<String>) -> Error {
    protocol_error(ProtocolErrorKind::UnexpectedPacket, msg)
}

pub(crate) fn connection_error(kind: ConnectionErrorKind, msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: msg.into(),
        server_error: None,
        source: None,
    })
}

pub(crate) fn usage_error(kind: UsageErrorKind, msg: impl Into<String>) -> Error {
    Error::Usage(UsageError::new(kind, msg))
}
