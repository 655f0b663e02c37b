//! Synchronous MySQL client wire protocol engine.
//!
//! This crate speaks the MySQL client/server protocol over any blocking
//! byte stream. It provides:
//!
//! - Packet framing with sequence numbers and 16MB splitting
//! - The connection phase (greeting, TLS upgrade, authentication plugins)
//! - The text protocol (COM_QUERY) and binary protocol (prepared statements)
//! - A codec for the binary temporal encodings
//! - Lazily-read result sets with borrowed or owned rows
//!
//! # Protocol overview
//!
//! Every message is a payload behind a 4-byte header:
//! - 3-byte little-endian payload length + 1-byte sequence number
//! - payloads of 16MB - 1 or more continue in the next packet
//! - sequence numbers restart at 0 with every command
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection, QueryResult};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(config)?;
//! if let QueryResult::Rows(mut rows) = conn.query("SELECT id, name FROM users")? {
//!     while let Some((id, name)) = rows.scan_next::<(i64, String)>()? {
//!         println!("{id}: {name}");
//!     }
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod protocol;
pub mod resultset;
pub mod schema;
pub mod temporal;
pub mod tls;
pub mod types;

pub use config::{MySqlConfig, SslMode, TlsConfig};
pub use connection::{ConnectionState, MySqlConnection, SharedMySqlConnection};
pub use handshake::{Greeting, HandshakeState};
pub use protocol::{OkPacket, Statement};
pub use resultset::{
    BinaryProtocol, BinaryRow, BinaryRowRef, Protocol, QueryResult, ResultSet, RowRef,
    TextProtocol, TextRow, TextRowRef,
};
pub use schema::{RowSchema, SemanticType};
pub use types::{ColumnDef, FieldType};
