//! # Values
//!
//! The dynamic value model used for modify payloads and decoded query rows.
//! Which variants are legal for a property is decided by its compiled
//! [`PropKind`](crate::schema::PropKind); nothing is coerced.

use std::collections::BTreeMap;

use serde::Serialize;

/// Node identifier, unique within a type. `0` means "no node".
pub type NodeId = u32;

/// A decoded node: property name → value (nested objects for dotted paths).
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    /// Epoch milliseconds
    Timestamp(i64),
    String(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
    /// Locale code → text
    Text(BTreeMap<String, String>),
    Vector(Vec<f32>),
    Object(Row),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) | Value::Timestamp(v) => Some(*v),
            Value::Number(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) | Value::Timestamp(v) => Some(*v as f64),
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Value::Object(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Number(_) => "number",
            Value::Timestamp(_) => "timestamp",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Json(_) => "json",
            Value::Text(_) => "text",
            Value::Vector(_) => "vector",
            Value::Object(_) => "object",
            Value::List(_) => "list",
        }
    }

    /// Display form used for group-by keys.
    pub fn key_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(v) | Value::Timestamp(v) => v.to_string(),
            Value::Number(v) => v.to_string(),
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

/// Look up a dotted path (`address.city`) in a row.
pub fn get_path<'a>(row: &'a Row, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = row.get(parts.next()?)?;
    for part in parts {
        current = current.as_row()?.get(part)?;
    }
    Some(current)
}

/// Insert a value at a dotted path, creating intermediate objects.
pub fn set_path(row: &mut Row, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            row.insert(path.to_string(), value);
        }
        Some((head, tail)) => {
            let entry = row
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Row::new()));
            if !matches!(entry, Value::Object(_)) {
                *entry = Value::Object(Row::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, tail, value);
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i64)
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Vector(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_paths() {
        let mut row = Row::new();
        set_path(&mut row, "address.city", "Amsterdam".into());
        set_path(&mut row, "address.zip", Value::Int(1011));
        set_path(&mut row, "name", "youzi".into());
        assert_eq!(get_path(&row, "address.city"), Some(&Value::from("Amsterdam")));
        assert_eq!(get_path(&row, "address.zip").and_then(Value::as_i64), Some(1011));
        assert!(get_path(&row, "address.street").is_none());
        assert!(get_path(&row, "name.first").is_none());
    }

    #[test]
    fn test_numeric_accessors() {
        assert_eq!(Value::Number(3.0).as_i64(), Some(3));
        assert_eq!(Value::Number(3.5).as_i64(), None);
        assert_eq!(Value::Timestamp(10).as_f64(), Some(10.0));
        assert_eq!(Value::from("x").as_f64(), None);
    }
}
