//! Prepared statement (binary protocol) packets.
//!
//! # Protocol Flow
//!
//! 1. **Prepare**: COM_STMT_PREPARE with the SQL text. The server answers with
//!    a prepare-OK (statement id, column count, param count, warnings),
//!    followed by the parameter definitions and the column definitions, each
//!    group closed by EOF unless `CLIENT_DEPRECATE_EOF` was negotiated.
//! 2. **Execute**: COM_STMT_EXECUTE with the statement id and the bound
//!    parameters. The server answers with OK, ERR or a binary result set.
//! 3. **Reset**: COM_STMT_RESET clears server-side execution state; answered
//!    with OK.
//! 4. **Close**: COM_STMT_CLOSE. The server sends no response.
//!
//! Builders here return payloads; the framer assigns sequence ids.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use sqlwire_core::{Result, Value};

use super::{Command, PacketReader, PacketWriter, malformed_with};
use crate::temporal;
use crate::types::{ColumnDef, FieldType};

/// Flag in the parameter type pair marking an unsigned integer.
pub const PARAM_UNSIGNED: u8 = 0x80;

/// COM_STMT_EXECUTE cursor flag: no cursor.
pub const CURSOR_TYPE_NO_CURSOR: u8 = 0x00;

/// Response to COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    /// Result columns (0 for statements without a result set)
    pub num_columns: u16,
    /// `?` placeholders in the SQL
    pub num_params: u16,
    pub warnings: u16,
}

/// A server-side prepared statement owned by one connection.
///
/// Column definitions are shared with every result set the statement
/// produces.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) id: u32,
    pub(crate) sql: String,
    pub(crate) params: Vec<ColumnDef>,
    pub(crate) columns: Arc<[ColumnDef]>,
    pub(crate) warnings: u16,
    pub(crate) closed: bool,
}

impl Statement {
    pub(crate) fn new(
        prepare_ok: StmtPrepareOk,
        sql: &str,
        params: Vec<ColumnDef>,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            id: prepare_ok.statement_id,
            sql: sql.to_string(),
            params,
            columns: columns.into(),
            warnings: prepare_ok.warnings,
            closed: false,
        }
    }

    /// Server-assigned statement id.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of parameters `execute` expects.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[ColumnDef] {
        &self.params
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Warnings reported while preparing.
    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    /// Whether `close_statement` has been called on this handle.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Build a COM_STMT_PREPARE payload.
pub fn build_stmt_prepare_packet(sql: &str) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtPrepare, sql.len());
    writer.write_bytes(sql.as_bytes());
    writer.into_bytes()
}

/// Build a COM_STMT_EXECUTE payload.
///
/// # Format
///
/// - statement id (u32)
/// - flags (u8, no cursor)
/// - iteration count (u32, always 1)
/// - if there are parameters:
///   - NULL bitmap, `(n + 7) / 8` bytes, bit `i` set for a NULL parameter
///   - new-params-bound flag (u8, always 1)
///   - `n` type pairs: field type, then 0x80 when unsigned
///   - the non-NULL values in order
///
/// The caller checks the parameter count against the statement before any
/// packet is built.
pub fn build_stmt_execute_packet(statement_id: u32, params: &[Value]) -> Result<Vec<u8>> {
    let mut writer = PacketWriter::command(Command::StmtExecute, 16 + params.len() * 16);
    writer.write_u32_le(statement_id);
    writer.write_u8(CURSOR_TYPE_NO_CURSOR);
    writer.write_u32_le(1);

    if params.is_empty() {
        return Ok(writer.into_bytes());
    }

    let bitmap_start = writer.len();
    writer.write_zeros(params.len().div_ceil(8));
    let bitmap = &mut writer.as_mut_bytes()[bitmap_start..];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }

    writer.write_u8(1);
    for param in params {
        let (field_type, unsigned) = param_type(param);
        writer.write_u8(field_type as u8);
        writer.write_u8(if unsigned { PARAM_UNSIGNED } else { 0 });
    }

    for param in params {
        encode_binary_param(&mut writer, param)?;
    }
    Ok(writer.into_bytes())
}

/// Build a COM_STMT_CLOSE payload. The server does not reply.
pub fn build_stmt_close_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtClose, 4);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Build a COM_STMT_RESET payload.
pub fn build_stmt_reset_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtReset, 4);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Parse a COM_STMT_PREPARE_OK payload.
///
/// # Format
///
/// - status 0x00
/// - statement id (u32)
/// - number of columns (u16)
/// - number of params (u16)
/// - reserved 0x00
/// - warning count (u16)
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Result<StmtPrepareOk> {
    let mut reader = PacketReader::new(data);
    let bad = || malformed_with("invalid COM_STMT_PREPARE response", data);

    if reader.read_u8().ok_or_else(bad)? != 0x00 {
        return Err(bad());
    }
    let statement_id = reader.read_u32_le().ok_or_else(bad)?;
    let num_columns = reader.read_u16_le().ok_or_else(bad)?;
    let num_params = reader.read_u16_le().ok_or_else(bad)?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);

    Ok(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

/// Wire type and unsigned flag used to bind `value`.
pub fn param_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::Int(_) => (FieldType::Long, false),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UnsignedBigInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) | Value::Json(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::Time(_) => (FieldType::Time, false),
        Value::DateTime(_) => (FieldType::DateTime, false),
    }
}

/// Append the binary encoding of one parameter. NULL writes nothing.
fn encode_binary_param(writer: &mut PacketWriter, value: &Value) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::SmallInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::Int(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::BigInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::UnsignedBigInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Date(d) => writer.write_bytes(&temporal::encode_date(d)?),
        Value::Time(t) => writer.write_bytes(&temporal::encode_time(t)?),
        Value::DateTime(dt) => writer.write_bytes(&temporal::encode_datetime(dt)?),
    }
    Ok(())
}
