//! CommandBuilder - argv-style construction

use crate::spec::{CommandSpec, Segment};
use crate::value::Value;
use xrun_foundation::Result;

/// Builds a [`CommandSpec`] word by word
///
/// Words are separated by single spaces. Values are validated by [`build`].
///
/// ```ignore
/// let spec = CommandBuilder::new("git")
///     .arg("commit")
///     .arg("-m")
///     .arg(message)
///     .build()?;
/// ```
///
/// [`build`]: CommandBuilder::build
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    segments: Vec<Segment>,
    words: usize,
}

impl CommandBuilder {
    /// Start with a program name (escaped like any other word)
    pub fn new(program: impl Into<Value>) -> Self {
        Self::default().arg(program)
    }

    /// Start from nothing
    pub fn empty() -> Self {
        Self::default()
    }

    fn separator(&mut self) {
        if self.words > 0 {
            self.segments.push(Segment::literal(" "));
        }
        self.words += 1;
    }

    /// Escaped argument; lists expand to several words
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.separator();
        self.segments.push(Segment::value(value));
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        for value in values {
            self = self.arg(value);
        }
        self
    }

    /// Unescaped shell text such as `|`, `&&` or `2>&1`
    pub fn literal(mut self, text: impl Into<String>) -> Self {
        self.separator();
        self.segments.push(Segment::literal(text));
        self
    }

    /// Unescaped value. Only for trusted input.
    pub fn raw_arg(mut self, value: impl Into<Value>) -> Self {
        self.separator();
        self.segments.push(Segment::raw(value));
        self
    }

    /// Append a segment with no separator
    pub fn segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self.words = self.words.max(1);
        self
    }

    pub fn build(self) -> Result<CommandSpec> {
        CommandSpec::build(self.segments)
    }
}
