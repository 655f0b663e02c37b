//! Result sets and the rows they yield.
//!
//! A [`ResultSet`] holds the connection until its rows are read. Rows arrive
//! one packet at a time:
//!
//! - [`ResultSet::next_raw`] lends a [`RowRef`] over the connection's read
//!   buffer; the borrow ends before the next row can be read.
//! - [`ResultSet::next_row`] (and the `Iterator` impl) copy the row out.
//!
//! Dropping an unfinished result set leaves the connection in
//! `ResultSetOpen`; the next command drains it first.

use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

use sqlwire_core::error::UsageErrorKind;
use sqlwire_core::{ColumnInfo, FromRow, Result, Row, Value};

use crate::connection::{MySqlConnection, RowPacket};
use crate::protocol::{OkPacket, PacketReader, malformed_with, usage_error};
use crate::schema::RowSchema;
use crate::temporal;
use crate::types::{ColumnDef, decode_binary_value, decode_text_value, read_binary_value};

mod private {
    pub trait Sealed {}
    impl Sealed for super::TextProtocol {}
    impl Sealed for super::BinaryProtocol {}
}

/// Row encoding of a result set.
pub trait Protocol: private::Sealed + Sized {
    /// Owned row produced by [`ResultSet::next_row`].
    type Row;

    /// Locate each column's bytes in a row payload; `None` marks NULL.
    #[allow(clippy::result_large_err)]
    fn split_row(payload: &[u8], columns: &[ColumnDef]) -> Result<Vec<Option<Range<usize>>>>;

    #[allow(clippy::result_large_err)]
    fn decode_value(col: &ColumnDef, raw: &[u8]) -> Result<Value>;

    #[allow(clippy::result_large_err)]
    fn to_owned_row(row: &RowRef<'_, Self>, column_info: &Arc<ColumnInfo>) -> Result<Self::Row>;
}

/// Rows of a COM_QUERY result: length-encoded strings, 0xFB for NULL.
#[derive(Debug, Clone, Copy)]
pub enum TextProtocol {}

/// Rows of a COM_STMT_EXECUTE result: null bitmap, then typed values.
#[derive(Debug, Clone, Copy)]
pub enum BinaryProtocol {}

impl Protocol for TextProtocol {
    type Row = TextRow;

    fn split_row(payload: &[u8], columns: &[ColumnDef]) -> Result<Vec<Option<Range<usize>>>> {
        let mut reader = PacketReader::new(payload);
        let mut spans = Vec::with_capacity(columns.len());
        for col in columns {
            let cell = reader.read_nullable_lenenc_slice().ok_or_else(|| {
                malformed_with(format!("truncated text value in column `{}`", col.name), payload)
            })?;
            let end = reader.position();
            spans.push(cell.map(|value| end - value.len()..end));
        }
        Ok(spans)
    }

    fn decode_value(col: &ColumnDef, raw: &[u8]) -> Result<Value> {
        Ok(decode_text_value(col, raw))
    }

    fn to_owned_row(row: &RowRef<'_, Self>, column_info: &Arc<ColumnInfo>) -> Result<TextRow> {
        Ok(TextRow {
            values: (0..row.len()).map(|i| row.raw(i).map(<[u8]>::to_vec)).collect(),
            columns: Arc::clone(row.columns),
            column_info: Arc::clone(column_info),
        })
    }
}

impl Protocol for BinaryProtocol {
    type Row = BinaryRow;

    /// # Format
    ///
    /// - 0x00 header
    /// - null bitmap, `(columns + 9) / 8` bytes, column `i` at bit `i + 2`
    /// - non-NULL values in column order
    fn split_row(payload: &[u8], columns: &[ColumnDef]) -> Result<Vec<Option<Range<usize>>>> {
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(0x00) {
            return Err(malformed_with("binary row without 0x00 header", payload));
        }
        let bitmap = reader
            .read_bytes((columns.len() + 9) / 8)
            .ok_or_else(|| malformed_with("truncated null bitmap", payload))?;

        let mut spans = Vec::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            let bit = i + 2;
            if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
                spans.push(None);
                continue;
            }
            let value = read_binary_value(&mut reader, col)?;
            // temporal cells are range-checked here so a bad one never reaches a RowRef
            if let Some(kind) = col.column_type.temporal_kind() {
                temporal::decode_temporal(value, kind)?;
            }
            let end = reader.position();
            spans.push(Some(end - value.len()..end));
        }
        Ok(spans)
    }

    fn decode_value(col: &ColumnDef, raw: &[u8]) -> Result<Value> {
        decode_binary_value(col, raw)
    }

    fn to_owned_row(row: &RowRef<'_, Self>, column_info: &Arc<ColumnInfo>) -> Result<BinaryRow> {
        row.decode(column_info).map(BinaryRow)
    }
}

/// A row view over the connection's read buffer.
#[derive(Debug)]
pub struct RowRef<'a, P: Protocol> {
    payload: &'a [u8],
    spans: Vec<Option<Range<usize>>>,
    columns: &'a Arc<[ColumnDef]>,
    _protocol: PhantomData<P>,
}

pub type TextRowRef<'a> = RowRef<'a, TextProtocol>;
pub type BinaryRowRef<'a> = RowRef<'a, BinaryProtocol>;

impl<'a, P: Protocol> RowRef<'a, P> {
    pub(crate) fn new(
        payload: &'a [u8],
        spans: Vec<Option<Range<usize>>>,
        columns: &'a Arc<[ColumnDef]>,
    ) -> Self {
        Self {
            payload,
            spans,
            columns,
            _protocol: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn columns(&self) -> &'a [ColumnDef] {
        self.columns
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.spans.get(index), Some(None))
    }

    /// Undecoded bytes of a column, `None` for NULL or an unknown index.
    ///
    /// Binary temporal values include their length byte.
    pub fn raw(&self, index: usize) -> Option<&'a [u8]> {
        let payload = self.payload;
        self.spans
            .get(index)?
            .as_ref()
            .map(|span| &payload[span.clone()])
    }

    /// Decode one column.
    #[allow(clippy::result_large_err)]
    pub fn get(&self, index: usize) -> Result<Value> {
        let Some(span) = self.spans.get(index) else {
            return Err(usage_error(
                UsageErrorKind::ArityMismatch,
                format!("column index {} out of range for {} columns", index, self.len()),
            ));
        };
        match span {
            Some(span) => P::decode_value(&self.columns[index], &self.payload[span.clone()]),
            None => Ok(Value::Null),
        }
    }

    /// Decode every column into an owned [`Row`].
    #[allow(clippy::result_large_err)]
    pub fn decode(&self, column_info: &Arc<ColumnInfo>) -> Result<Row> {
        let values = (0..self.len())
            .map(|i| self.get(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::with_columns(Arc::clone(column_info), values))
    }

    /// Copy each column's raw bytes into `dest`, positionally.
    #[allow(clippy::result_large_err)]
    pub fn scan_into(&self, dest: &mut [Option<Vec<u8>>]) -> Result<()> {
        if dest.len() != self.len() {
            return Err(arity_mismatch(self.len(), dest.len()));
        }
        for (i, slot) in dest.iter_mut().enumerate() {
            *slot = self.raw(i).map(<[u8]>::to_vec);
        }
        Ok(())
    }
}

/// An owned text protocol row.
#[derive(Debug, Clone)]
pub struct TextRow {
    values: Vec<Option<Vec<u8>>>,
    columns: Arc<[ColumnDef]>,
    column_info: Arc<ColumnInfo>,
}

impl TextRow {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Raw bytes of a column, `None` for NULL or an unknown index.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index)?.as_deref()
    }

    /// A column as UTF-8 text; `None` for NULL or invalid UTF-8.
    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    pub fn values(&self) -> &[Option<Vec<u8>>] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Option<Vec<u8>>> {
        self.values
    }

    /// Convert each column according to its definition.
    pub fn decode(&self) -> Row {
        let values = self
            .values
            .iter()
            .zip(self.columns.iter())
            .map(|(raw, col)| match raw {
                Some(raw) => decode_text_value(col, raw),
                None => Value::Null,
            })
            .collect();
        Row::with_columns(Arc::clone(&self.column_info), values)
    }

    /// Decode and bind the row positionally into `T`.
    #[allow(clippy::result_large_err)]
    pub fn scan<T: FromRow>(&self) -> Result<T> {
        T::from_row(&self.decode())
    }
}

/// An owned, decoded binary protocol row.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryRow(Row);

impl BinaryRow {
    pub fn row(&self) -> &Row {
        &self.0
    }

    pub fn into_row(self) -> Row {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    #[allow(clippy::result_large_err)]
    pub fn get_as<T: sqlwire_core::FromValue>(&self, index: usize) -> Result<T> {
        self.0.get_as(index)
    }

    /// Bind the row positionally into `T`.
    #[allow(clippy::result_large_err)]
    pub fn scan<T: FromRow>(&self) -> Result<T> {
        self.0.scan()
    }
}

/// Outcome of a command that may return rows.
#[derive(Debug)]
pub enum QueryResult<'c, P: Protocol = TextProtocol> {
    /// The command completed without rows
    Done(OkPacket),
    Rows(ResultSet<'c, P>),
}

impl<'c, P: Protocol> QueryResult<'c, P> {
    pub fn is_rows(&self) -> bool {
        matches!(self, Self::Rows(_))
    }

    pub fn into_rows(self) -> Option<ResultSet<'c, P>> {
        match self {
            Self::Rows(rows) => Some(rows),
            Self::Done(_) => None,
        }
    }

    /// Discard any rows and return the final status.
    #[allow(clippy::result_large_err)]
    pub fn finish(self) -> Result<OkPacket> {
        match self {
            Self::Done(ok) => Ok(ok),
            Self::Rows(mut rows) => rows.drain(),
        }
    }
}

/// A lazily-read result set.
pub struct ResultSet<'c, P: Protocol> {
    conn: &'c mut MySqlConnection,
    columns: Arc<[ColumnDef]>,
    column_info: Arc<ColumnInfo>,
    completion: Option<OkPacket>,
    finished: bool,
    _protocol: PhantomData<P>,
}

impl<P: Protocol> std::fmt::Debug for ResultSet<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("columns", &self.column_info.names())
            .field("finished", &self.finished)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

impl<'c, P: Protocol> ResultSet<'c, P> {
    pub(crate) fn new(conn: &'c mut MySqlConnection, columns: Arc<[ColumnDef]>) -> Self {
        let names = columns.iter().map(|c| c.name.clone()).collect();
        Self {
            conn,
            columns,
            column_info: Arc::new(ColumnInfo::new(names)),
            completion: None,
            finished: false,
            _protocol: PhantomData,
        }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_info(&self) -> &Arc<ColumnInfo> {
        &self.column_info
    }

    /// True once the terminating packet (or an error) has been read.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Status of the terminating OK/EOF packet, once all rows are read.
    pub fn completion(&self) -> Option<&OkPacket> {
        self.completion.as_ref()
    }

    /// Fail unless every column can feed the matching schema slot.
    #[allow(clippy::result_large_err)]
    pub fn check_schema(&self, schema: &RowSchema) -> Result<()> {
        schema.check(&self.columns)
    }

    /// Read the next packet; true if it holds a row.
    #[allow(clippy::result_large_err)]
    fn advance(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        match self.conn.next_row_packet() {
            Ok(RowPacket::Row) => Ok(true),
            Ok(RowPacket::End(ok)) => {
                self.finished = true;
                self.completion = Some(ok);
                Ok(false)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    /// Borrow the next row without copying it.
    #[allow(clippy::result_large_err)]
    pub fn next_raw(&mut self) -> Result<Option<RowRef<'_, P>>> {
        if !self.advance()? {
            return Ok(None);
        }
        let spans = match P::split_row(self.conn.framer.last_payload(), &self.columns) {
            Ok(spans) => spans,
            Err(e) => {
                self.finished = true;
                return Err(self.conn.fail(e));
            }
        };
        Ok(Some(RowRef::new(
            self.conn.framer.last_payload(),
            spans,
            &self.columns,
        )))
    }

    /// Read the next row as an owned copy.
    #[allow(clippy::result_large_err)]
    pub fn next_row(&mut self) -> Result<Option<P::Row>> {
        let column_info = Arc::clone(&self.column_info);
        let decoded = match self.next_raw()? {
            Some(row) => P::to_owned_row(&row, &column_info).map(Some),
            None => Ok(None),
        };
        self.check_decoded(decoded)
    }

    /// Decode the next row and bind it positionally into `T`.
    #[allow(clippy::result_large_err)]
    pub fn scan_next<T: FromRow>(&mut self) -> Result<Option<T>> {
        let column_info = Arc::clone(&self.column_info);
        let decoded = match self.next_raw()? {
            Some(row) => row
                .decode(&column_info)
                .and_then(|row| T::from_row(&row))
                .map(Some),
            None => Ok(None),
        };
        self.check_decoded(decoded)
    }

    /// A fatal decode error ends the set and breaks the connection.
    #[allow(clippy::result_large_err)]
    fn check_decoded<T>(&mut self, decoded: Result<T>) -> Result<T> {
        decoded.map_err(|e| {
            if e.is_fatal() {
                self.finished = true;
            }
            self.conn.fail(e)
        })
    }

    /// Read all remaining rows.
    #[allow(clippy::result_large_err)]
    pub fn collect_all(&mut self) -> Result<Vec<P::Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Read and discard the remaining rows, returning the final status.
    #[allow(clippy::result_large_err)]
    pub fn drain(&mut self) -> Result<OkPacket> {
        while self.advance()? {}
        Ok(self.completion.clone().unwrap_or_default())
    }
}

impl<P: Protocol> Iterator for ResultSet<'_, P> {
    type Item = Result<P::Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

fn arity_mismatch(columns: usize, destinations: usize) -> sqlwire_core::Error {
    usage_error(
        UsageErrorKind::ArityMismatch,
        format!(
            "row has {} columns but {} destinations were supplied",
            columns, destinations
        ),
    )
}
