//! Interpolated values

use xrun_foundation::{Error, Result};

/// A value interpolated into a command template
///
/// Lists expand into one token per element. `Null`, non-finite floats,
/// non-UTF-8 bytes, nested lists and anything containing a NUL byte have no
/// textual representation and fail command construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Value>),
    Bytes(Vec<u8>),
    Null,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Bool(_) => "boolean",
            Self::List(_) => "list",
            Self::Bytes(_) => "bytes",
            Self::Null => "null",
        }
    }

    /// Textual tokens this value expands into
    pub fn to_tokens(&self) -> Result<Vec<String>> {
        match self {
            Self::List(items) => items
                .iter()
                .map(Self::to_text)
                .collect(),
            scalar => Ok(vec![scalar.to_text()?]),
        }
    }

    fn to_text(&self) -> Result<String> {
        let text = match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) if f.is_finite() => f.to_string(),
            Self::Float(f) => {
                return Err(Error::Validation(format!(
                    "float {} has no textual representation",
                    f
                )))
            }
            Self::Bool(b) => b.to_string(),
            Self::Bytes(bytes) => String::from_utf8(bytes.clone()).map_err(|_| {
                Error::Validation("byte value is not valid UTF-8".into())
            })?,
            Self::Null => {
                return Err(Error::Validation(
                    "null has no textual representation".into(),
                ))
            }
            Self::List(_) => {
                return Err(Error::Validation(
                    "nested lists have no textual representation".into(),
                ))
            }
        };
        if text.contains('\0') {
            return Err(Error::Validation(
                "value contains a NUL byte and cannot be passed to a shell".into(),
            ));
        }
        Ok(text)
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

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Null)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        use serde_json::Value as Json;
        Ok(match value {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().ok_or_else(|| {
                    Error::Validation(format!("number {} is out of range", n))
                })?),
            },
            Json::String(s) => Self::Str(s),
            Json::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::try_from)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Json::Object(_) => {
                return Err(Error::Validation(
                    "objects have no textual representation".into(),
                ))
            }
        })
    }
}
