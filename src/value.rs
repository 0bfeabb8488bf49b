//! Values exchanged between generated code and the kernel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(Object),
    /// Reference to a catalog symbol.
    Function(String),
    Method(BoundMethod),
}

/// Instance of a registered class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub class: String,
    pub fields: BTreeMap<String, Value>,
}

/// Method looked up on a receiver, not yet invoked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundMethod {
    pub receiver: Box<Value>,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Unit,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Tuple,
    Map,
    Object,
    Function,
    Method,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Map => "map",
            Self::Object => "object",
            Self::Function => "function",
            Self::Method => "method",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Unit => ValueKind::Unit,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::List(_) => ValueKind::List,
            Self::Tuple(_) => ValueKind::Tuple,
            Self::Map(_) => ValueKind::Map,
            Self::Object(_) => ValueKind::Object,
            Self::Function(_) => ValueKind::Function,
            Self::Method(_) => ValueKind::Method,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Self::Function(_) | Self::Method(_))
    }

    pub fn function(symbol: impl Into<String>) -> Self {
        Self::Function(symbol.into())
    }

    /// Bind `name` on `receiver`.
    pub fn method(receiver: Value, name: impl Into<String>) -> Self {
        Self::Method(BoundMethod {
            receiver: Box::new(receiver),
            name: name.into(),
        })
    }

    pub fn object(class: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        Self::Object(Object {
            class: class.into(),
            fields,
        })
    }

    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Short human-readable rendering used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::Function(symbol) => format!("function '{symbol}'"),
            Self::Method(m) => format!("method '{}.{}'", m.receiver.type_name(), m.name),
            other => format!("value of type '{}'", other.type_name()),
        }
    }

    /// Kind name, or the class name for objects.
    pub fn type_name(&self) -> String {
        match self {
            Self::Object(obj) => obj.class.clone(),
            other => other.kind().as_str().to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
