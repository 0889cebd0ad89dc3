//! Runtime values.

use std::fmt;
use std::sync::Arc;

use super::types::Representation;
use crate::compile::Constant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Int(i64),
    Bool(bool),
    Str(Arc<str>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Display form for results and inspection; strings are quoted.
    pub fn representation(&self) -> Representation {
        let text = match self {
            Value::Str(s) => format!("{:?}", s),
            other => other.to_string(),
        };
        Representation {
            type_name: self.type_name().to_string(),
            text,
        }
    }
}

/// Plain form, as `print` and `str` render it.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<&Constant> for Value {
    fn from(constant: &Constant) -> Self {
        match constant {
            Constant::Int(n) => Value::Int(*n),
            Constant::Str(s) => Value::Str(Arc::from(s.as_str())),
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Nil => Value::Nil,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_representation_quotes_strings() {
        let value = Value::Str(Arc::from("hi \"there\""));
        assert_eq!(value.representation().text, r#""hi \"there\"""#);
        assert_eq!(value.to_string(), "hi \"there\"");
        assert_eq!(Value::Int(-3).representation().type_name, "int");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Str(Arc::from("x")).is_truthy());
        assert!(!Value::Str(Arc::from("")).is_truthy());
    }
}
