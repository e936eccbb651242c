//! Declared result shapes.
//!
//! A [`Shape`] is the structural type a call site expects back. It is written in a
//! Python-flavoured shorthand (`list[list[str]]`, `tuple[list[str], int]`,
//! `Person{name: str, age: int}`) and serves two purposes: it is shown to the backend
//! when prompting, and it is checked against the value a candidate returns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::LambdaValue;

/// Field carrying the type name of a user-defined record value.
pub const TYPE_TAG: &str = "__type__";

/// A structural type expectation attached to a call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shape {
    Any,
    Text,
    Int,
    Float,
    Bool,
    None,
    List(Box<Shape>),
    /// Object with string keys and homogeneous values.
    Dict(Box<Shape>),
    Tuple(Vec<Shape>),
    Optional(Box<Shape>),
    /// A user-defined record. Conformance is a capability check: every declared field
    /// must be present and conform. With no declared fields the `__type__` tag must match.
    Instance {
        name: String,
        fields: Vec<(String, Shape)>,
    },
}

/// Where and how a value failed to conform to a [`Shape`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("at {path}: expected {expected}, found {found}")]
pub struct ShapeMismatch {
    pub path: String,
    pub expected: String,
    pub found: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid shape at column {position}: {message}")]
pub struct ShapeParseError {
    pub position: usize,
    pub message: String,
}

impl Shape {
    pub fn list(inner: Shape) -> Self {
        Shape::List(Box::new(inner))
    }

    pub fn instance(name: impl Into<String>) -> Self {
        Shape::Instance {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Checks `value` against this shape, reporting the first violation found.
    pub fn check(&self, value: &LambdaValue) -> Result<(), ShapeMismatch> {
        self.check_at(value, "$")
    }

    pub fn accepts(&self, value: &LambdaValue) -> bool {
        self.check(value).is_ok()
    }

    fn check_at(&self, value: &LambdaValue, path: &str) -> Result<(), ShapeMismatch> {
        let mismatch = || ShapeMismatch {
            path: path.to_string(),
            expected: self.to_string(),
            found: describe(value),
        };

        match self {
            Shape::Any => Ok(()),
            Shape::Text if value.is_string() => Ok(()),
            Shape::Int if value.is_i64() || value.is_u64() => Ok(()),
            Shape::Float if value.is_number() => Ok(()),
            Shape::Bool if value.is_boolean() => Ok(()),
            Shape::None if value.is_null() => Ok(()),
            Shape::Optional(_) if value.is_null() => Ok(()),
            Shape::Optional(inner) => inner.check_at(value, path),
            Shape::List(inner) => {
                let items = value.as_array().ok_or_else(mismatch)?;
                for (i, item) in items.iter().enumerate() {
                    inner.check_at(item, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            Shape::Tuple(parts) => {
                let items = value.as_array().ok_or_else(mismatch)?;
                if items.len() != parts.len() {
                    return Err(ShapeMismatch {
                        path: path.to_string(),
                        expected: self.to_string(),
                        found: format!("list of length {}", items.len()),
                    });
                }
                for (i, (part, item)) in parts.iter().zip(items).enumerate() {
                    part.check_at(item, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            Shape::Dict(inner) => {
                let map = value.as_object().ok_or_else(mismatch)?;
                for (key, item) in map {
                    inner.check_at(item, &format!("{}.{}", path, key))?;
                }
                Ok(())
            }
            Shape::Instance { name, fields } => {
                let map = value.as_object().ok_or_else(mismatch)?;
                if fields.is_empty() {
                    return match map.get(TYPE_TAG).and_then(|t| t.as_str()) {
                        Some(tag) if tag == name => Ok(()),
                        _ => Err(mismatch()),
                    };
                }
                for (field, shape) in fields {
                    let field_path = format!("{}.{}", path, field);
                    match map.get(field) {
                        Some(item) => shape.check_at(item, &field_path)?,
                        None => {
                            return Err(ShapeMismatch {
                                path: field_path,
                                expected: shape.to_string(),
                                found: "missing field".to_string(),
                            });
                        }
                    }
                }
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }
}

/// Short human description of a value's runtime kind, used in mismatch reports.
pub fn describe(value: &LambdaValue) -> String {
    match value {
        LambdaValue::Null => "none".to_string(),
        LambdaValue::Bool(_) => "bool".to_string(),
        LambdaValue::Number(n) if n.is_f64() => "float".to_string(),
        LambdaValue::Number(_) => "int".to_string(),
        LambdaValue::String(_) => "str".to_string(),
        LambdaValue::Array(items) => format!("list of length {}", items.len()),
        LambdaValue::Object(map) => match map.get(TYPE_TAG).and_then(|t| t.as_str()) {
            Some(tag) => format!("instance of {}", tag),
            None => "dict".to_string(),
        },
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Any => write!(f, "any"),
            Shape::Text => write!(f, "str"),
            Shape::Int => write!(f, "int"),
            Shape::Float => write!(f, "float"),
            Shape::Bool => write!(f, "bool"),
            Shape::None => write!(f, "none"),
            Shape::List(inner) => write!(f, "list[{}]", inner),
            Shape::Dict(inner) => write!(f, "dict[{}]", inner),
            Shape::Optional(inner) => write!(f, "optional[{}]", inner),
            Shape::Tuple(parts) => {
                write!(f, "tuple[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", part)?;
                }
                write!(f, "]")
            }
            Shape::Instance { name, fields } => {
                write!(f, "{}", name)?;
                if !fields.is_empty() {
                    write!(f, "{{")?;
                    for (i, (field, shape)) in fields.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}: {}", field, shape)?;
                    }
                    write!(f, "}}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Shape {
    type Err = ShapeParseError;

    /// Parses shorthand such as `"list[list[str]]"` or `"Person{name: str, age: int}"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = ShapeParser {
            chars: s.chars().collect(),
            pos: 0,
        };
        let shape = parser.parse_shape()?;
        parser.skip_ws();
        if parser.pos < parser.chars.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(shape)
    }
}

struct ShapeParser {
    chars: Vec<char>,
    pos: usize,
}

impl ShapeParser {
    fn error(&self, message: impl Into<String>) -> ShapeParseError {
        ShapeParseError {
            position: self.pos,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), ShapeParseError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c)))
        }
    }

    fn ident(&mut self) -> Result<String, ShapeParseError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.chars.len()
            && (self.chars[self.pos].is_alphanumeric() || self.chars[self.pos] == '_')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a type name"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_args(&mut self) -> Result<Vec<Shape>, ShapeParseError> {
        let mut args = vec![self.parse_shape()?];
        while self.eat(',') {
            args.push(self.parse_shape()?);
        }
        self.expect(']')?;
        Ok(args)
    }

    fn single_arg(&mut self, name: &str) -> Result<Box<Shape>, ShapeParseError> {
        if !self.eat('[') {
            return Ok(Box::new(Shape::Any));
        }
        let mut args = self.parse_args()?;
        match (name, args.len()) {
            // dict[str, V] keeps only the value shape, keys are always text
            ("dict", 2) => Ok(Box::new(args.remove(1))),
            (_, 1) => Ok(Box::new(args.remove(0))),
            _ => Err(self.error(format!("{} takes a single type argument", name))),
        }
    }

    fn parse_shape(&mut self) -> Result<Shape, ShapeParseError> {
        let name = self.ident()?;
        let shape = match name.to_ascii_lowercase().as_str() {
            "any" | "object" => Shape::Any,
            "str" | "string" | "text" => Shape::Text,
            "int" | "integer" => Shape::Int,
            "float" | "number" => Shape::Float,
            "bool" | "boolean" => Shape::Bool,
            "none" | "null" => Shape::None,
            "list" | "sequence" => Shape::List(self.single_arg("list")?),
            "dict" | "map" => Shape::Dict(self.single_arg("dict")?),
            "optional" => Shape::Optional(self.single_arg("optional")?),
            "tuple" => {
                self.expect('[')?;
                Shape::Tuple(self.parse_args()?)
            }
            _ => {
                let mut fields = Vec::new();
                if self.eat('{') {
                    if !self.eat('}') {
                        loop {
                            let field = self.ident()?;
                            self.expect(':')?;
                            fields.push((field, self.parse_shape()?));
                            if self.eat('}') {
                                break;
                            }
                            self.expect(',')?;
                        }
                    }
                }
                Shape::Instance { name, fields }
            }
        };
        Ok(shape)
    }
}

/// Macro for shape shorthand literals: `shape!("list[list[str]]")`
#[macro_export]
macro_rules! shape {
    ($s:expr) => {
        $s.parse::<$crate::Shape>().expect("Invalid shape shorthand")
    };
}
