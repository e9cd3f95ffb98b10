//! CommandSpec - parsed command template

use crate::dialect::{quote, ShellDialect};
use crate::value::Value;
use xrun_foundation::{Error, Result};

/// Input segment of a command template
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal command text, passed through unchanged
    Literal(String),
    /// Interpolated value, escaped per dialect unless `raw`
    Value { value: Value, raw: bool },
}

impl Segment {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value {
            value: value.into(),
            raw: false,
        }
    }

    /// Value inserted without escaping. Only for trusted input.
    pub fn raw(value: impl Into<Value>) -> Self {
        Self::Value {
            value: value.into(),
            raw: true,
        }
    }
}

impl From<&str> for Segment {
    fn from(text: &str) -> Self {
        Self::Literal(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Tokens { tokens: Vec<String>, raw: bool },
}

/// Adapter-agnostic, escaping-safe command
///
/// Values are validated when the spec is built, so rendering cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    parts: Vec<Part>,
}

impl CommandSpec {
    /// Build from ordered segments
    pub fn build(segments: impl IntoIterator<Item = Segment>) -> Result<Self> {
        let mut parts = Vec::new();
        for segment in segments {
            match segment {
                Segment::Literal(text) => {
                    if text.contains('\0') {
                        return Err(Error::Validation(
                            "command text contains a NUL byte".into(),
                        ));
                    }
                    parts.push(Part::Literal(text));
                }
                Segment::Value { value, raw } => {
                    let tokens = value.to_tokens().map_err(|e| match e {
                        Error::Validation(msg) => Error::Validation(format!(
                            "cannot interpolate {} value: {}",
                            value.type_name(),
                            msg
                        )),
                        other => other,
                    })?;
                    parts.push(Part::Tokens { tokens, raw });
                }
            }
        }

        let spec = Self { parts };
        if spec.to_raw().trim().is_empty() {
            return Err(Error::Validation("command is empty".into()));
        }
        Ok(spec)
    }

    /// Caller-supplied command line, used verbatim
    pub fn raw(command: impl Into<String>) -> Result<Self> {
        Self::build([Segment::Literal(command.into())])
    }

    /// Parse a `{}` template
    ///
    /// `{}` interpolates the next value with escaping, `{!}` without.
    /// `{{` and `}}` produce literal braces.
    pub fn template<I, V>(template: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut values = values.into_iter().map(Into::into);
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();
        let mut placeholders = 0usize;

        while let Some(c) = chars.next() {
            let raw = match c {
                '{' => match chars.next() {
                    Some('{') => {
                        literal.push('{');
                        continue;
                    }
                    Some('}') => false,
                    Some('!') if chars.next() == Some('}') => true,
                    _ => {
                        return Err(Error::Validation(format!(
                            "unmatched '{{' in command template {:?}",
                            template
                        )))
                    }
                },
                '}' => {
                    if chars.next() == Some('}') {
                        literal.push('}');
                        continue;
                    }
                    return Err(Error::Validation(format!(
                        "unmatched '}}' in command template {:?}",
                        template
                    )));
                }
                other => {
                    literal.push(other);
                    continue;
                }
            };

            placeholders += 1;
            let value = values.next().ok_or_else(|| {
                Error::Validation(format!(
                    "command template {:?} needs more than {} values",
                    template,
                    placeholders - 1
                ))
            })?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Value { value, raw });
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if values.next().is_some() {
            return Err(Error::Validation(format!(
                "command template {:?} has {} placeholders but more values were given",
                template, placeholders
            )));
        }
        Self::build(segments)
    }

    /// Render for `dialect`, escaping every non-raw value
    pub fn to_shell_string(&self, dialect: ShellDialect) -> String {
        self.render(Some(dialect))
    }

    /// Render without escaping anything. Opt-in only.
    pub fn to_raw(&self) -> String {
        self.render(None)
    }

    fn render(&self, dialect: Option<ShellDialect>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Tokens { tokens, raw } => {
                    let rendered: Vec<String> = match dialect {
                        Some(d) if !raw => tokens.iter().map(|t| quote(t, d).into_owned()).collect(),
                        _ => tokens.clone(),
                    };
                    out.push_str(&rendered.join(" "));
                }
            }
        }
        out
    }

    /// Number of interpolated values
    pub fn value_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::Tokens { .. }))
            .count()
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_shell_string(ShellDialect::Posix))
    }
}
