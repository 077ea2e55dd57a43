//! Canonical database types and value coercion.
//!
//! Every value bound to a statement or read back from a provider is a [`Value`].
//! Its [`DbType`] tag is the backend-neutral classification used for parameter
//! binding; [`coerce`] narrows or widens a value across tags.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CommanderError, Result};

/// Canonical type tag for parameters and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbType {
    Boolean,
    Byte,
    Int16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Single,
    Double,
    Decimal,
    DateTime,
    DateTimeOffset,
    Uuid,
    Text,
    Binary,
}

impl DbType {
    /// Tag of a value, `None` for NULL.
    pub fn of(value: &Value) -> Option<DbType> {
        value.db_type()
    }

    /// Map a backend's declared column type name to a tag.
    ///
    /// Exact names are tried first, then SQLite-style affinity rules. Anything
    /// unrecognized (including an empty declaration) falls back to `Text`.
    pub fn from_declared(declared: &str) -> DbType {
        let upper = declared.trim().to_ascii_uppercase();
        let base = match upper.find('(') {
            Some(idx) => upper[..idx].trim(),
            None => upper.as_str(),
        };

        match base {
            "BIT" | "BOOL" | "BOOLEAN" => DbType::Boolean,
            "TINYINT" => DbType::Byte,
            "SMALLINT" | "INT2" => DbType::Int16,
            "INT" | "INT4" | "MEDIUMINT" => DbType::Int32,
            "INTEGER" | "BIGINT" | "INT8" => DbType::Int64,
            "UNSIGNED BIG INT" => DbType::UInt64,
            "FLOAT4" => DbType::Single,
            "REAL" | "FLOAT" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => DbType::Double,
            "DECIMAL" | "NUMERIC" | "MONEY" | "SMALLMONEY" => DbType::Decimal,
            "DATETIMEOFFSET" | "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => {
                DbType::DateTimeOffset
            }
            "DATE" | "DATETIME" | "DATETIME2" | "SMALLDATETIME" | "TIMESTAMP" => DbType::DateTime,
            "UNIQUEIDENTIFIER" | "UUID" | "GUID" => DbType::Uuid,
            "BLOB" | "BINARY" | "VARBINARY" | "IMAGE" | "BYTEA" => DbType::Binary,
            other if other.contains("INT") => DbType::Int64,
            other if other.contains("BLOB") => DbType::Binary,
            other if other.contains("REAL") || other.contains("FLOA") || other.contains("DOUB") => {
                DbType::Double
            }
            _ => DbType::Text,
        }
    }

    /// Integer tags (the candidates for a default sort field are `Int32`/`Int64`).
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DbType::Byte
                | DbType::Int16
                | DbType::Int32
                | DbType::UInt32
                | DbType::Int64
                | DbType::UInt64
        )
    }
}

/// Rust types with a fixed canonical tag.
pub trait CanonicalType {
    const DB_TYPE: DbType;
}

/// Canonical tag of a native type.
pub fn canonical_type<T: CanonicalType + ?Sized>() -> DbType {
    T::DB_TYPE
}

/// Owned, nullable database value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Byte(u8),
    I16(i16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Uuid(Uuid),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[must_use]
    pub fn db_type(&self) -> Option<DbType> {
        let tag = match self {
            Value::Null => return None,
            Value::Bool(_) => DbType::Boolean,
            Value::Byte(_) => DbType::Byte,
            Value::I16(_) => DbType::Int16,
            Value::I32(_) => DbType::Int32,
            Value::U32(_) => DbType::UInt32,
            Value::I64(_) => DbType::Int64,
            Value::U64(_) => DbType::UInt64,
            Value::F32(_) => DbType::Single,
            Value::F64(_) => DbType::Double,
            Value::Decimal(_) => DbType::Decimal,
            Value::DateTime(_) => DbType::DateTime,
            Value::DateTimeOffset(_) => DbType::DateTimeOffset,
            Value::Uuid(_) => DbType::Uuid,
            Value::Text(_) => DbType::Text,
            Value::Bytes(_) => DbType::Binary,
        };
        Some(tag)
    }

    /// Exact integer value for integer variants.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(i64::from(*v)),
            Value::I16(v) => Some(i64::from(*v)),
            Value::I32(v) => Some(i64::from(*v)),
            Value::U32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            Value::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Integral part under cast semantics: integers exactly, decimals and
    /// finite floats truncated toward zero.
    fn integral(&self) -> Option<i128> {
        match self {
            Value::Byte(v) => Some(i128::from(*v)),
            Value::I16(v) => Some(i128::from(*v)),
            Value::I32(v) => Some(i128::from(*v)),
            Value::U32(v) => Some(i128::from(*v)),
            Value::I64(v) => Some(i128::from(*v)),
            Value::U64(v) => Some(i128::from(*v)),
            Value::Decimal(v) => v.trunc().to_i128(),
            Value::F32(v) if v.is_finite() => Some(v.trunc() as i128),
            Value::F64(v) if v.is_finite() => Some(v.trunc() as i128),
            _ => None,
        }
    }

    fn real(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            Value::Decimal(v) => v.to_f64(),
            other => other.integral().map(|v| v as f64),
        }
    }

    fn is_integer(&self) -> bool {
        self.db_type().map(DbType::is_integer).unwrap_or(false)
    }
}

macro_rules! canonical {
    ($($ty:ty => $tag:ident, $variant:ident;)*) => {
        $(
            impl CanonicalType for $ty {
                const DB_TYPE: DbType = DbType::$tag;
            }

            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

canonical! {
    bool => Boolean, Bool;
    u8 => Byte, Byte;
    i16 => Int16, I16;
    i32 => Int32, I32;
    u32 => UInt32, U32;
    i64 => Int64, I64;
    u64 => UInt64, U64;
    f32 => Single, F32;
    f64 => Double, F64;
    Decimal => Decimal, Decimal;
    NaiveDateTime => DateTime, DateTime;
    DateTime<FixedOffset> => DateTimeOffset, DateTimeOffset;
    Uuid => Uuid, Uuid;
    String => Text, Text;
    Vec<u8> => Binary, Bytes;
}

impl CanonicalType for str {
    const DB_TYPE: DbType = DbType::Text;
}

impl CanonicalType for [u8] {
    const DB_TYPE: DbType = DbType::Binary;
}

impl<T: CanonicalType> CanonicalType for Option<T> {
    const DB_TYPE: DbType = T::DB_TYPE;
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Normalize an arbitrary byte sequence to a 16-byte identifier.
///
/// Shorter input is zero-padded at the tail, longer input is truncated.
pub fn uuid_from_bytes(bytes: &[u8]) -> Uuid {
    let mut buf = [0u8; 16];
    let n = bytes.len().min(16);
    buf[..n].copy_from_slice(&bytes[..n]);
    Uuid::from_bytes(buf)
}

/// Parse text as an identifier, yielding the nil identifier on failure.
pub fn uuid_from_text(text: &str) -> Uuid {
    Uuid::parse_str(text.trim()).unwrap_or(Uuid::nil())
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Convert `value` to the representation of `target`.
///
/// NULL stays NULL. A value already tagged `target` is returned unchanged.
/// Numeric conversions follow cast semantics (truncation toward zero, wrapping
/// on integer narrowing). Fails with `UnsupportedType` when no path exists.
pub fn coerce(value: Value, target: DbType) -> Result<Value> {
    if value.is_null() || value.db_type() == Some(target) {
        return Ok(value);
    }

    let converted = match target {
        DbType::Boolean => value
            .is_integer()
            .then(|| value.integral())
            .flatten()
            .map(|v| Value::Bool(v != 0)),
        DbType::Byte => value.integral().map(|v| Value::Byte(v as u8)),
        DbType::Int16 => value.integral().map(|v| Value::I16(v as i16)),
        DbType::Int32 => value.integral().map(|v| Value::I32(v as i32)),
        DbType::UInt32 => value.integral().map(|v| Value::U32(v as u32)),
        DbType::Int64 => value.integral().map(|v| Value::I64(v as i64)),
        DbType::UInt64 => value.integral().map(|v| Value::U64(v as u64)),
        DbType::Single => value.real().map(|v| Value::F32(v as f32)),
        DbType::Double => match &value {
            Value::F32(v) => Some(Value::F64(f64::from(*v))),
            other => other.real().map(Value::F64),
        },
        DbType::Decimal => match &value {
            Value::F32(v) => Decimal::from_f32(*v).map(Value::Decimal),
            Value::F64(v) => Decimal::from_f64(*v).map(Value::Decimal),
            Value::U64(v) => Some(Value::Decimal(Decimal::from(*v))),
            other => other.as_i64().map(|v| Value::Decimal(Decimal::from(v))),
        },
        DbType::Text => match &value {
            Value::Uuid(v) => Some(Value::Text(v.to_string())),
            Value::Decimal(v) => Some(Value::Text(v.to_string())),
            Value::F32(v) => Some(Value::Text(v.to_string())),
            Value::F64(v) => Some(Value::Text(v.to_string())),
            Value::DateTime(v) => Some(Value::Text(v.format(DATETIME_FORMATS[0]).to_string())),
            Value::DateTimeOffset(v) => Some(Value::Text(v.to_rfc3339())),
            other => other.as_i64().map(|v| Value::Text(v.to_string())),
        },
        DbType::Uuid => match &value {
            Value::Text(v) => Some(Value::Uuid(uuid_from_text(v))),
            Value::Bytes(v) => Some(Value::Uuid(uuid_from_bytes(v))),
            _ => None,
        },
        DbType::Binary => match &value {
            Value::Uuid(v) => Some(Value::Bytes(v.as_bytes().to_vec())),
            _ => None,
        },
        DbType::DateTime => match &value {
            Value::DateTimeOffset(v) => Some(Value::DateTime(v.naive_utc())),
            Value::Text(v) => parse_datetime(v).map(Value::DateTime),
            _ => None,
        },
        DbType::DateTimeOffset => match &value {
            Value::DateTime(v) => Some(Value::DateTimeOffset(
                DateTime::from_naive_utc_and_offset(*v, Utc.fix()),
            )),
            Value::Text(v) => DateTime::parse_from_rfc3339(v.trim())
                .ok()
                .map(Value::DateTimeOffset),
            _ => None,
        },
    };

    converted.ok_or_else(|| CommanderError::unsupported(&value, target))
}
