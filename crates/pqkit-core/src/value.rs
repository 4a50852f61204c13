//! Dynamic SQL values used as prepared-statement arguments.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TypeError};

/// A dynamically-typed SQL value.
///
/// Null is a distinct variant; binding `Value::Null` sends an SQL NULL and is
/// never rendered as an empty string or the text `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data, may contain NUL bytes
    Bytes(Vec<u8>),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE PRECISION",
            Value::Decimal(_) => "NUMERIC",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BYTEA",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Server text representation, or `None` for NULL.
    ///
    /// Byte strings must be valid UTF-8 to have a text form; callers that need
    /// raw bytes use binary format instead.
    pub fn to_text(&self) -> Result<Option<String>> {
        let text = match self {
            Value::Null => return Ok(None),
            Value::Bool(v) => if *v { "t" } else { "f" }.to_string(),
            Value::SmallInt(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::BigInt(v) => v.to_string(),
            Value::Float(v) => float_text(f64::from(*v)),
            Value::Double(v) => float_text(*v),
            Value::Decimal(s) | Value::Text(s) => s.clone(),
            Value::Bytes(b) => std::str::from_utf8(b)
                .map_err(|e| {
                    Error::Type(TypeError {
                        expected: "UTF-8 text",
                        actual: format!("bytes invalid at offset {}", e.valid_up_to()),
                        column: None,
                    })
                })?
                .to_string(),
            Value::Json(j) => j.to_string(),
        };
        Ok(Some(text))
    }
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        v.to_string()
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::BigInt(i64::from(v))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(v: &[u8; N]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_none_is_null_not_empty() {
        let v: Value = Option::<&str>::None.into();
        assert!(v.is_null());
        assert_eq!(v.to_text().unwrap(), None);

        let empty: Value = "".into();
        assert_eq!(empty.to_text().unwrap(), Some(String::new()));
    }

    #[test]
    fn text_forms() {
        assert_eq!(Value::Bool(true).to_text().unwrap().as_deref(), Some("t"));
        assert_eq!(Value::Int(-4).to_text().unwrap().as_deref(), Some("-4"));
        assert_eq!(
            Value::Double(f64::NEG_INFINITY).to_text().unwrap().as_deref(),
            Some("-Infinity")
        );
        assert_eq!(
            Value::Json(serde_json::json!({"a": 1})).to_text().unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );
    }

    #[test]
    fn bytes_with_nul_have_text_form_but_invalid_utf8_does_not() {
        let nul: Value = b"Test\0data".into();
        assert_eq!(nul.to_text().unwrap().map(|s| s.len()), Some(9));

        let bad = Value::Bytes(vec![0x66, 0xff]);
        let err = bad.to_text().unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }

    #[test]
    fn type_names() {
        assert_eq!(Value::Bytes(vec![]).type_name(), "BYTEA");
        assert_eq!(Value::from(7_u32), Value::BigInt(7));
    }
}
