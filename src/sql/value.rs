//! SQL values and their comparison semantics.
//!
//! Values follow MySQL-leaning coercion: comparing a number against a string
//! parses the string when possible, equality with NULL is never true, and
//! NULL sorts lowest under ascending order.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The type of a value or column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int32,
    Int64,
    UInt64,
    Double,
    Text,
    Blob,
    Timestamp,
    Json,
    Array,
}

impl ValueKind {
    /// SQL-facing name of the type, as shown by DESCRIBE.
    pub fn sql_name(&self) -> &'static str {
        match self {
            ValueKind::Bool => "BOOLEAN",
            ValueKind::Int32 => "INT",
            ValueKind::Int64 => "BIGINT",
            ValueKind::UInt64 => "BIGINT UNSIGNED",
            ValueKind::Double => "DOUBLE",
            ValueKind::Text => "TEXT",
            ValueKind::Blob => "BLOB",
            ValueKind::Timestamp => "TIMESTAMP",
            ValueKind::Json => "JSON",
            ValueKind::Array => "ARRAY",
        }
    }

    /// Whether the kind is one of the numeric families.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ValueKind::Int32 | ValueKind::Int64 | ValueKind::UInt64 | ValueKind::Double
        )
    }
}

/// A single SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
    /// UTC timestamp, microsecond precision.
    Timestamp(DateTime<Utc>),
    /// Opaque JSON text.
    Json(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Kind of this value, or None for NULL (NULL has no kind).
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int32(_) => Some(ValueKind::Int32),
            Value::Int64(_) => Some(ValueKind::Int64),
            Value::UInt64(_) => Some(ValueKind::UInt64),
            Value::Double(_) => Some(ValueKind::Double),
            Value::Text(_) => Some(ValueKind::Text),
            Value::Blob(_) => Some(ValueKind::Blob),
            Value::Timestamp(_) => Some(ValueKind::Timestamp),
            Value::Json(_) => Some(ValueKind::Json),
            Value::Array(_) => Some(ValueKind::Array),
        }
    }

    pub fn text(s: impl Into<String>) -> Value {
        Value::Text(s.into())
    }

    /// Borrow as text if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used by coercing comparison and arithmetic.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int32(n) => Some(*n as f64),
            Value::Int64(n) => Some(*n as f64),
            Value::UInt64(n) => Some(*n as f64),
            Value::Double(d) => Some(*d),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Timestamp(t) => Some(t.timestamp() as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(n) => Some(*n as i64),
            Value::Int64(n) => Some(*n),
            Value::UInt64(n) => i64::try_from(*n).ok(),
            Value::Double(d) if d.fract() == 0.0 => Some(*d as i64),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Truthiness for WHERE: NULL and non-coercible values are not truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Text(s) => s.parse::<f64>().map(|f| f != 0.0).unwrap_or(false),
            other => other.as_f64().map(|f| f != 0.0).unwrap_or(false),
        }
    }

    /// SQL equality. Returns None when either side is NULL.
    pub fn sql_eq(&self, other: &Value) -> Option<bool> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.sql_cmp(other) == Some(Ordering::Equal))
    }

    /// SQL comparison with coercion. None when either side is NULL or the
    /// values are incomparable.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Blob(a), Blob(b)) => Some(a.cmp(b)),
            (Text(a), Blob(b)) => Some(a.as_bytes().cmp(&b[..])),
            (Blob(a), Text(b)) => Some(a[..].cmp(b.as_bytes())),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (Array(a), Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.sql_cmp(y) {
                        Some(Ordering::Equal) => continue,
                        other => return other,
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            (Json(a), Json(b)) => Some(a.cmp(b)),
            // Everything else goes through numeric coercion; a text operand
            // that does not parse as a number compares as text against the
            // other side's display form.
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => Some(a.to_string().cmp(&b.to_string())),
            },
        }
    }

    /// Total order used by ORDER BY and index layouts: NULL is least, then
    /// `sql_cmp`, falling back to the display form for mixed kinds.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self
                .sql_cmp(other)
                .unwrap_or_else(|| self.to_string().cmp(&other.to_string())),
        }
    }

    /// Append a canonical byte encoding of this value, usable as a hash key
    /// for DISTINCT, GROUP BY and index lookup. Values that compare equal
    /// under `sql_eq` encode to the same bytes: `sql_cmp` compares numeric
    /// pairs (booleans included) in f64 space, so the key uses that same
    /// representation for every numeric kind, and +0.0 collapses with -0.0.
    pub fn encode_key(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(0),
            Value::Bool(_)
            | Value::Int32(_)
            | Value::Int64(_)
            | Value::UInt64(_)
            | Value::Double(_) => {
                let f = self.as_f64().expect("numeric value");
                let f = if f == 0.0 { 0.0 } else { f };
                buf.push(2);
                buf.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Value::Text(s) => {
                buf.push(5);
                buf.extend_from_slice(&(s.len() as u64).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                buf.push(6);
                buf.extend_from_slice(&(b.len() as u64).to_be_bytes());
                buf.extend_from_slice(b);
            }
            Value::Timestamp(t) => {
                buf.push(7);
                buf.extend_from_slice(&t.timestamp_micros().to_be_bytes());
            }
            Value::Json(s) => {
                buf.push(8);
                buf.extend_from_slice(&(s.len() as u64).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Array(items) => {
                buf.push(9);
                buf.extend_from_slice(&(items.len() as u64).to_be_bytes());
                for item in items {
                    item.encode_key(buf);
                }
            }
        }
    }

    /// Encode a whole tuple of values into one key.
    pub fn encode_tuple(values: &[Value]) -> Vec<u8> {
        let mut buf = Vec::new();
        for v in values {
            v.encode_key(&mut buf);
        }
        buf
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int32(n) => write!(f, "{}", n),
            Value::Int64(n) => write!(f, "{}", n),
            Value::UInt64(n) => write!(f, "{}", n),
            Value::Double(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Value::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S%.6f")),
            Value::Json(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}
