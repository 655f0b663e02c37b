//! Declarative row schemas.
//!
//! A [`RowSchema`] lists what each column of a result must look like. It is
//! checked against the column definitions once, before any row is decoded,
//! and against each decoded row for nullability.

use sqlwire_core::error::{TypeError, TypeErrorKind, UsageErrorKind};
use sqlwire_core::{Error, Result, Row, Value};

use crate::protocol::usage_error;
use crate::types::{ColumnDef, FieldType};

/// Kind of value a schema slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticType {
    Integer,
    UnsignedInteger,
    Float,
    Decimal,
    Text,
    Bytes,
    Date,
    Time,
    DateTime,
    Json,
    /// Any wire type
    Any,
}

impl SemanticType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::UnsignedInteger => "unsigned integer",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::Bytes => "bytes",
            Self::Date => "date",
            Self::Time => "time",
            Self::DateTime => "datetime",
            Self::Json => "json",
            Self::Any => "any",
        }
    }

    /// Can a column of this definition feed the slot?
    pub fn accepts(self, col: &ColumnDef) -> bool {
        let ty = col.column_type;
        if ty == FieldType::Null {
            return true;
        }
        match self {
            Self::Any => true,
            Self::Integer => ty.is_integer(),
            Self::UnsignedInteger => ty.is_integer() && col.is_unsigned(),
            Self::Float => ty.is_float(),
            Self::Decimal => ty.is_decimal() || ty.is_integer(),
            Self::Text => (ty.is_string() || ty.is_blob() || ty == FieldType::Json) && !col.is_binary(),
            Self::Bytes => ty.is_string() || ty.is_blob() || ty == FieldType::Bit,
            Self::Date => matches!(ty, FieldType::Date | FieldType::NewDate),
            Self::Time => matches!(ty, FieldType::Time | FieldType::Time2),
            Self::DateTime => matches!(
                ty,
                FieldType::DateTime
                    | FieldType::DateTime2
                    | FieldType::Timestamp
                    | FieldType::Timestamp2
                    | FieldType::Date
                    | FieldType::NewDate
            ),
            Self::Json => ty == FieldType::Json,
        }
    }
}

/// One column slot: accepted type and whether NULL is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub ty: SemanticType,
    pub nullable: bool,
}

/// Ordered column slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSchema {
    slots: Vec<Slot>,
}

impl RowSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a non-nullable slot.
    pub fn column(mut self, ty: SemanticType) -> Self {
        self.slots.push(Slot { ty, nullable: false });
        self
    }

    /// Append a nullable slot.
    pub fn nullable(mut self, ty: SemanticType) -> Self {
        self.slots.push(Slot { ty, nullable: true });
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Check column definitions against the slots.
    ///
    /// `ArityMismatch` when the counts differ, `TypeMismatch` for the first
    /// column whose wire type cannot feed its slot.
    #[allow(clippy::result_large_err)]
    pub fn check(&self, columns: &[ColumnDef]) -> Result<()> {
        if columns.len() != self.slots.len() {
            return Err(usage_error(
                UsageErrorKind::ArityMismatch,
                format!(
                    "result has {} columns but the schema has {} slots",
                    columns.len(),
                    self.slots.len()
                ),
            ));
        }
        for (slot, col) in self.slots.iter().zip(columns) {
            if !slot.ty.accepts(col) {
                return Err(Error::Type(TypeError {
                    kind: TypeErrorKind::Mismatch,
                    expected: slot.ty.name(),
                    actual: col.column_type.name().to_string(),
                    column: Some(col.name.clone()),
                    rust_type: None,
                }));
            }
        }
        Ok(())
    }

    /// Check a decoded row against the slots' nullability.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self, row: &Row) -> Result<()> {
        if row.len() != self.slots.len() {
            return Err(usage_error(
                UsageErrorKind::ArityMismatch,
                format!(
                    "row has {} columns but the schema has {} slots",
                    row.len(),
                    self.slots.len()
                ),
            ));
        }
        for (i, (slot, value)) in self.slots.iter().zip(row.values()).enumerate() {
            if !slot.nullable && matches!(value, Value::Null) {
                return Err(Error::Type(TypeError {
                    kind: TypeErrorKind::UnexpectedNull,
                    expected: slot.ty.name(),
                    actual: "NULL".to_string(),
                    column: row.column_names().nth(i).map(str::to_string),
                    rust_type: None,
                }));
            }
        }
        Ok(())
    }
}
