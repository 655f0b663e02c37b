//! Decoded row representation and positional binding.

use crate::Result;
use crate::error::{Error, TypeError, TypeErrorKind, UsageError, UsageErrorKind};
use crate::temporal::{Date, DateTime, Time};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names of a result set, shared by every row through an `Arc`.
///
/// Lookup by name finds the first column with that name; `SELECT a.id, b.id`
/// yields two `id` columns and only the first is reachable by name.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let mut by_name = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            by_name.entry(name.clone()).or_insert(i);
        }
        Self { names, by_name }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A fully decoded, owned row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl PartialEq for ColumnInfo {
    fn eq(&self, other: &Self) -> bool {
        self.names == other.names
    }
}

impl Row {
    /// Build a row with its own column metadata.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Convert the value at `index`. Errors name the column.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.get(index).ok_or_else(|| {
            Error::Type(TypeError {
                kind: TypeErrorKind::Mismatch,
                expected: std::any::type_name::<T>(),
                actual: format!(
                    "index {} out of bounds (row has {} columns)",
                    index,
                    self.len()
                ),
                column: None,
                rust_type: None,
            })
        })?;
        T::from_value(value).map_err(|e| with_column(e, self.columns.name_at(index)))
    }

    #[allow(clippy::result_large_err)]
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                kind: TypeErrorKind::Mismatch,
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
                rust_type: None,
            })
        })?;
        T::from_value(value).map_err(|e| with_column(e, Some(name)))
    }

    /// Bind the whole row positionally into `T`.
    #[allow(clippy::result_large_err)]
    pub fn scan<T: FromRow>(&self) -> Result<T> {
        T::from_row(self)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// `(column name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

fn with_column(err: Error, column: Option<&str>) -> Error {
    match err {
        Error::Type(mut te) if te.column.is_none() => {
            te.column = column.map(str::to_string);
            Error::Type(te)
        }
        e => e,
    }
}

/// Error for a value that cannot feed `expected`.
///
/// NULL reports `UnexpectedNull`; every other kind reports a mismatch.
fn conversion_error(expected: &'static str, value: &Value) -> Error {
    let kind = if value.is_null() {
        TypeErrorKind::UnexpectedNull
    } else {
        TypeErrorKind::Mismatch
    };
    Error::Type(TypeError {
        kind,
        expected,
        actual: value.type_name().to_string(),
        column: None,
        rust_type: Some(expected),
    })
}

fn out_of_range(expected: &'static str, shown: impl std::fmt::Display) -> Error {
    Error::Type(TypeError {
        kind: TypeErrorKind::Mismatch,
        expected,
        actual: format!("value {} out of range", shown),
        column: None,
        rust_type: Some(expected),
    })
}

/// Conversion out of a decoded [`Value`].
pub trait FromValue: Sized {
    #[allow(clippy::result_large_err)]
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_bool()
            .ok_or_else(|| conversion_error("bool", value))
    }
}

macro_rules! impl_from_value_int {
    ($($ty:ty),+) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Result<Self> {
                    let name = stringify!($ty);
                    match value {
                        Value::UnsignedBigInt(v) => {
                            <$ty>::try_from(*v).map_err(|_| out_of_range(name, v))
                        }
                        other => {
                            let v = other.as_i64().ok_or_else(|| conversion_error(name, other))?;
                            <$ty>::try_from(v).map_err(|_| out_of_range(name, v))
                        }
                    }
                }
            }
        )+
    };
}

impl_from_value_int!(i8, i16, i32, i64, u8, u16, u32, u64);

#[allow(clippy::cast_possible_truncation)]
impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v),
            other => other
                .as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| conversion_error("f32", other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| conversion_error("f64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s.clone()),
            Value::Json(v) => Ok(v.to_string()),
            _ => Err(conversion_error("String", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) | Value::Decimal(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(conversion_error("Vec<u8>", value)),
        }
    }
}

impl FromValue for Date {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            Value::Text(s) => s.parse(),
            _ => Err(conversion_error("Date", value)),
        }
    }
}

impl FromValue for Time {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Time(t) => Ok(*t),
            Value::Text(s) => s.parse(),
            _ => Err(conversion_error("Time", value)),
        }
    }
}

impl FromValue for DateTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            Value::Date(d) => Ok(DateTime::from_date(*d)),
            Value::Text(s) => s.parse(),
            _ => Err(conversion_error("DateTime", value)),
        }
    }
}

/// JSON columns arrive as `Value::Json` from the binary protocol and as
/// text from the text protocol.
impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Text(s) => serde_json::from_str(s).map_err(|e| {
                Error::Type(TypeError {
                    kind: TypeErrorKind::Mismatch,
                    expected: "JSON",
                    actual: format!("invalid JSON: {}", e),
                    column: None,
                    rust_type: Some("serde_json::Value"),
                })
            }),
            _ => Err(conversion_error("JSON", value)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// Positional binding of a whole row into a Rust value.
///
/// Implemented for tuples of up to twelve `FromValue` elements; the tuple
/// arity must equal the row's column count.
pub trait FromRow: Sized {
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

impl FromRow for Vec<Value> {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.values.clone())
    }
}

/// Fail with `ArityMismatch` unless the row has exactly `expected` columns.
#[allow(clippy::result_large_err)]
pub fn check_arity(row: &Row, expected: usize) -> Result<()> {
    if row.len() == expected {
        Ok(())
    } else {
        Err(Error::Usage(UsageError::new(
            UsageErrorKind::ArityMismatch,
            format!(
                "row has {} columns but {} destinations were supplied",
                row.len(),
                expected
            ),
        )))
    }
}

macro_rules! impl_from_row_tuple {
    ($len:expr => $($idx:tt $T:ident),+) => {
        impl<$($T: FromValue),+> FromRow for ($($T,)+) {
            fn from_row(row: &Row) -> Result<Self> {
                check_arity(row, $len)?;
                Ok(($(row.get_as::<$T>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1 => 0 A);
impl_from_row_tuple!(2 => 0 A, 1 B);
impl_from_row_tuple!(3 => 0 A, 1 B, 2 C);
impl_from_row_tuple!(4 => 0 A, 1 B, 2 C, 3 D);
impl_from_row_tuple!(5 => 0 A, 1 B, 2 C, 3 D, 4 E);
impl_from_row_tuple!(6 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F);
impl_from_row_tuple!(7 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G);
impl_from_row_tuple!(8 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H);
impl_from_row_tuple!(9 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H, 8 I);
impl_from_row_tuple!(10 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H, 8 I, 9 J);
impl_from_row_tuple!(11 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H, 8 I, 9 J, 10 K);
impl_from_row_tuple!(12 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H, 8 I, 9 J, 10 K, 11 L);
