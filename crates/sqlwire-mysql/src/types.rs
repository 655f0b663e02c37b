//! MySQL column metadata and value decoding.
//!
//! The text protocol sends every value as a string; the binary protocol sends
//! type-specific encodings whose width depends on the column's field type.
//! Both are decoded here into [`Value`] using the column definition.

#![allow(clippy::cast_possible_truncation)]

use sqlwire_core::{Result, Value};

use crate::protocol::{PacketReader, malformed, malformed_with};
use crate::temporal::{self, TemporalKind};

/// MySQL field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type code, `None` for codes the server never sends.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        let ty = match value {
            0x00 => Self::Decimal,
            0x01 => Self::Tiny,
            0x02 => Self::Short,
            0x03 => Self::Long,
            0x04 => Self::Float,
            0x05 => Self::Double,
            0x06 => Self::Null,
            0x07 => Self::Timestamp,
            0x08 => Self::LongLong,
            0x09 => Self::Int24,
            0x0A => Self::Date,
            0x0B => Self::Time,
            0x0C => Self::DateTime,
            0x0D => Self::Year,
            0x0E => Self::NewDate,
            0x0F => Self::VarChar,
            0x10 => Self::Bit,
            0x11 => Self::Timestamp2,
            0x12 => Self::DateTime2,
            0x13 => Self::Time2,
            0xF5 => Self::Json,
            0xF6 => Self::NewDecimal,
            0xF7 => Self::Enum,
            0xF8 => Self::Set,
            0xF9 => Self::TinyBlob,
            0xFA => Self::MediumBlob,
            0xFB => Self::LongBlob,
            0xFC => Self::Blob,
            0xFD => Self::VarString,
            0xFE => Self::String,
            0xFF => Self::Geometry,
            _ => return None,
        };
        Some(ty)
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Tiny | Self::Short | Self::Long | Self::LongLong | Self::Int24 | Self::Year
        )
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, Self::Decimal | Self::NewDecimal)
    }

    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            Self::VarChar | Self::VarString | Self::String | Self::Enum | Self::Set
        )
    }

    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            Self::TinyBlob | Self::MediumBlob | Self::LongBlob | Self::Blob | Self::Geometry
        )
    }

    /// The temporal layout this type uses on the wire, if any.
    #[must_use]
    pub const fn temporal_kind(self) -> Option<TemporalKind> {
        match self {
            Self::Date | Self::NewDate => Some(TemporalKind::Date),
            Self::Time | Self::Time2 => Some(TemporalKind::Time),
            Self::DateTime | Self::DateTime2 | Self::Timestamp | Self::Timestamp2 => {
                Some(TemporalKind::DateTime)
            }
            _ => None,
        }
    }

    /// Width of a fixed-size binary value, `None` for length-prefixed types.
    #[must_use]
    pub const fn binary_width(self) -> Option<usize> {
        match self {
            Self::Tiny => Some(1),
            Self::Short | Self::Year => Some(2),
            Self::Long | Self::Int24 | Self::Float => Some(4),
            Self::LongLong | Self::Double => Some(8),
            Self::Null => Some(0),
            _ => None,
        }
    }

    /// SQL name of the type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Decimal | Self::NewDecimal => "DECIMAL",
            Self::Tiny => "TINYINT",
            Self::Short => "SMALLINT",
            Self::Long => "INT",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
            Self::Null => "NULL",
            Self::Timestamp | Self::Timestamp2 => "TIMESTAMP",
            Self::LongLong => "BIGINT",
            Self::Int24 => "MEDIUMINT",
            Self::Date | Self::NewDate => "DATE",
            Self::Time | Self::Time2 => "TIME",
            Self::DateTime | Self::DateTime2 => "DATETIME",
            Self::Year => "YEAR",
            Self::VarChar | Self::VarString => "VARCHAR",
            Self::Bit => "BIT",
            Self::Json => "JSON",
            Self::Enum => "ENUM",
            Self::Set => "SET",
            Self::TinyBlob => "TINYBLOB",
            Self::MediumBlob => "MEDIUMBLOB",
            Self::LongBlob => "LONGBLOB",
            Self::Blob => "BLOB",
            Self::String => "CHAR",
            Self::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Character set id of the `binary` collation.
pub const BINARY_CHARSET: u16 = 63;

/// Column definition (Protocol::ColumnDefinition41).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub catalog: String,
    pub schema: String,
    /// Table name or alias
    pub table: String,
    pub org_table: String,
    /// Column name or alias
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a column definition packet.
    ///
    /// # Format
    ///
    /// Six length-encoded strings (catalog, schema, table, org_table, name,
    /// org_name), a length-encoded 0x0C, then charset (u16), column length
    /// (u32), type (u8), flags (u16) and decimals (u8).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let bad = || malformed_with("truncated column definition", payload);

        let catalog = reader.read_lenenc_string().ok_or_else(bad)?;
        let schema = reader.read_lenenc_string().ok_or_else(bad)?;
        let table = reader.read_lenenc_string().ok_or_else(bad)?;
        let org_table = reader.read_lenenc_string().ok_or_else(bad)?;
        let name = reader.read_lenenc_string().ok_or_else(bad)?;
        let org_name = reader.read_lenenc_string().ok_or_else(bad)?;

        let fixed_len = reader.read_lenenc_int().ok_or_else(bad)?;
        if fixed_len < 0x0C {
            return Err(malformed_with(
                format!("column definition fixed block is {} bytes", fixed_len),
                payload,
            ));
        }
        let charset = reader.read_u16_le().ok_or_else(bad)?;
        let column_length = reader.read_u32_le().ok_or_else(bad)?;
        let type_code = reader.read_u8().ok_or_else(bad)?;
        let flags = reader.read_u16_le().ok_or_else(bad)?;
        let decimals = reader.read_u8().ok_or_else(bad)?;

        let column_type = FieldType::from_u8(type_code)
            .ok_or_else(|| malformed(format!("unknown column type 0x{:02X}", type_code)))?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Binary data rather than text (the `binary` character set).
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.charset == BINARY_CHARSET
    }
}

/// Decode a text protocol value.
///
/// Numbers that fail to parse fall back to `Value::Text` so nothing is lost.
/// Unsigned columns widen to the next signed type; `BIGINT UNSIGNED` becomes
/// `Value::UnsignedBigInt`.
pub fn decode_text_value(col: &ColumnDef, data: &[u8]) -> Value {
    let text = String::from_utf8_lossy(data);
    let unsigned = col.is_unsigned();
    let fallback = || Value::Text(text.clone().into_owned());

    match col.column_type {
        FieldType::Tiny if unsigned => text.parse::<u8>().map_or_else(|_| fallback(), Value::from),
        FieldType::Tiny => text.parse::<i8>().map_or_else(|_| fallback(), Value::TinyInt),
        FieldType::Short if unsigned => {
            text.parse::<u16>().map_or_else(|_| fallback(), Value::from)
        }
        FieldType::Short | FieldType::Year => {
            text.parse::<i16>().map_or_else(|_| fallback(), Value::SmallInt)
        }
        FieldType::Long | FieldType::Int24 if unsigned => {
            text.parse::<u32>().map_or_else(|_| fallback(), Value::from)
        }
        FieldType::Long | FieldType::Int24 => {
            text.parse::<i32>().map_or_else(|_| fallback(), Value::Int)
        }
        FieldType::LongLong if unsigned => text
            .parse::<u64>()
            .map_or_else(|_| fallback(), Value::UnsignedBigInt),
        FieldType::LongLong => text.parse::<i64>().map_or_else(|_| fallback(), Value::BigInt),
        FieldType::Float => text.parse::<f32>().map_or_else(|_| fallback(), Value::Float),
        FieldType::Double => text.parse::<f64>().map_or_else(|_| fallback(), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.to_string()),
        FieldType::Json => {
            serde_json::from_str(&text).map_or_else(|_| fallback(), Value::Json)
        }
        FieldType::Null => Value::Null,
        FieldType::Bit | FieldType::Geometry => Value::Bytes(data.to_vec()),
        ty => match ty.temporal_kind() {
            Some(TemporalKind::Date) => text.parse().map_or_else(|_| fallback(), Value::Date),
            Some(TemporalKind::Time) => text.parse().map_or_else(|_| fallback(), Value::Time),
            Some(TemporalKind::DateTime) => {
                text.parse().map_or_else(|_| fallback(), Value::DateTime)
            }
            None if col.is_binary() => Value::Bytes(data.to_vec()),
            None => Value::Text(text.to_string()),
        },
    }
}

/// Split one binary protocol value off `reader` without decoding it.
///
/// Fixed-width values yield exactly their bytes, temporal values include
/// their length byte, and everything else yields the length-encoded content.
pub fn read_binary_value<'a>(reader: &mut PacketReader<'a>, col: &ColumnDef) -> Result<&'a [u8]> {
    let ty = col.column_type;
    let truncated = || malformed(format!("truncated {} value in column `{}`", ty.name(), col.name));

    if let Some(width) = ty.binary_width() {
        return reader.read_bytes(width).ok_or_else(truncated);
    }
    if ty.temporal_kind().is_some() {
        let len = reader.peek().ok_or_else(truncated)?;
        return reader
            .read_bytes(1 + usize::from(len))
            .ok_or_else(truncated);
    }
    reader.read_lenenc_slice().ok_or_else(truncated)
}

/// Decode a binary protocol value split off by [`read_binary_value`].
pub fn decode_binary_value(col: &ColumnDef, raw: &[u8]) -> Result<Value> {
    let ty = col.column_type;
    let unsigned = col.is_unsigned();
    let wrong_width = || {
        malformed(format!(
            "{} value in column `{}` has {} bytes",
            ty.name(),
            col.name,
            raw.len()
        ))
    };

    let value = match ty {
        FieldType::Null => Value::Null,
        FieldType::Tiny => {
            let b = fixed::<1>(raw).ok_or_else(wrong_width)?;
            if unsigned {
                Value::from(b[0])
            } else {
                Value::TinyInt(i8::from_le_bytes(b))
            }
        }
        FieldType::Short | FieldType::Year => {
            let b = fixed::<2>(raw).ok_or_else(wrong_width)?;
            if unsigned {
                Value::from(u16::from_le_bytes(b))
            } else {
                Value::SmallInt(i16::from_le_bytes(b))
            }
        }
        FieldType::Long | FieldType::Int24 => {
            let b = fixed::<4>(raw).ok_or_else(wrong_width)?;
            if unsigned {
                Value::from(u32::from_le_bytes(b))
            } else {
                Value::Int(i32::from_le_bytes(b))
            }
        }
        FieldType::LongLong => {
            let b = fixed::<8>(raw).ok_or_else(wrong_width)?;
            if unsigned {
                Value::UnsignedBigInt(u64::from_le_bytes(b))
            } else {
                Value::BigInt(i64::from_le_bytes(b))
            }
        }
        FieldType::Float => Value::Float(f32::from_le_bytes(
            fixed::<4>(raw).ok_or_else(wrong_width)?,
        )),
        FieldType::Double => Value::Double(f64::from_le_bytes(
            fixed::<8>(raw).ok_or_else(wrong_width)?,
        )),
        FieldType::Decimal | FieldType::NewDecimal => {
            Value::Decimal(String::from_utf8_lossy(raw).into_owned())
        }
        FieldType::Json => serde_json::from_slice(raw)
            .map_or_else(|_| Value::Text(String::from_utf8_lossy(raw).into_owned()), Value::Json),
        FieldType::Bit | FieldType::Geometry => Value::Bytes(raw.to_vec()),
        ty => match ty.temporal_kind() {
            Some(kind) => temporal::decode_temporal(raw, kind)?,
            None if col.is_binary() => Value::Bytes(raw.to_vec()),
            None => Value::Text(String::from_utf8_lossy(raw).into_owned()),
        },
    };
    Ok(value)
}

fn fixed<const N: usize>(raw: &[u8]) -> Option<[u8; N]> {
    raw.try_into().ok()
}
