/*!
 * Core data types for Liaison.
 *
 * This module defines the value types shared by the device layer and the RPC server.
 */
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for Liaison resources
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

/// A dynamically typed value, serialized as plain JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
    /// Array of values
    Array(Vec<Value>),
    /// Map of string keys to values
    Object(HashMap<String, Value>),
}

impl Value {
    /// Check if the value is a primitive (not an array or object)
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }

    /// Short name of the value's type, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Interpret the value as a flag.
    ///
    /// Remote callers frequently send flags as strings (`"True"`, `"false"`, `"1"`),
    /// so those are accepted alongside booleans and integers.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Integer(i) => Some(*i != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to get an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if *f == (*f as i64) as f64 => Some(*f as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to get a float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get an array value
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Try to get an object value
    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            other => match serde_json::to_string(other) {
                Ok(json) => write!(f, "{}", json),
                Err(_) => write!(f, "{:?}", other),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! value_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(i: $t) -> Self {
                    Value::Integer(i64::from(i))
                }
            }
        )*
    };
}

value_from_integer!(i32, i64, u8, u16, u32);

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Integer(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::Array(a)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(o: HashMap<String, Value>) -> Self {
        Value::Object(o)
    }
}

/// A key-value pair of metadata
pub type Metadata = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        let id = Id::new();
        assert!(!id.as_str().is_empty());

        let id: Id = "conn-1".into();
        assert_eq!(id.as_str(), "conn-1");
        assert_eq!(format!("{}", id), "conn-1");
    }

    #[test]
    fn test_value_json_shape() {
        let v: Value = serde_json::from_str(r#"[1, 2.5, "a", true, null]"#).unwrap();
        assert_eq!(
            v,
            Value::Array(vec![
                Value::Integer(1),
                Value::Float(2.5),
                Value::String("a".to_string()),
                Value::Bool(true),
                Value::Null,
            ])
        );
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"[1,2.5,"a",true,null]"#);
    }

    #[test]
    fn test_primitive_check() {
        assert!(Value::Integer(3).is_primitive());
        assert!(Value::Null.is_primitive());
        assert!(!Value::Array(vec![]).is_primitive());
        assert!(!Value::Object(HashMap::new()).is_primitive());
    }

    #[test]
    fn test_flag_coercion() {
        assert_eq!(Value::from("True").as_flag(), Some(true));
        assert_eq!(Value::from("false").as_flag(), Some(false));
        assert_eq!(Value::Integer(0).as_flag(), Some(false));
        assert_eq!(Value::Bool(true).as_flag(), Some(true));
        assert_eq!(Value::from("maybe").as_flag(), None);
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::Float(3.0).as_integer(), Some(3));
        assert_eq!(Value::Float(3.5).as_integer(), None);
        assert_eq!(Value::from("127").as_integer(), Some(127));
        assert_eq!(Value::Integer(2).as_float(), Some(2.0));
    }
}
