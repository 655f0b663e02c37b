//! Core types for sqlwire.
//!
//! This crate holds the protocol-neutral pieces shared by the wire engines:
//!
//! - `Error` taxonomy and `Result` alias
//! - `Value`, the dynamically-typed SQL value
//! - `Date`, `Time` and `DateTime` temporal values
//! - `Row` with the `FromValue` / `FromRow` binding traits

pub mod error;
pub mod row;
pub mod temporal;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, ProtocolErrorKind,
    QueryError, QueryErrorKind, Result, ServerErrorInfo, TypeError, TypeErrorKind, UsageError,
    UsageErrorKind,
};
pub use row::{ColumnInfo, FromRow, FromValue, Row};
pub use temporal::{Date, DateTime, Time};
pub use value::Value;
