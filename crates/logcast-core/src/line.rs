use std::fmt;
use std::sync::Arc;

/// One trimmed, non-empty, terminator-free line of console or log output.
///
/// The only way to build a `LogLine` is [`LogLine::new`], which rejects text
/// that is empty after trimming, so every value in circulation is broadcastable.
/// Cloning is cheap: the text is shared.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LogLine(Arc<str>);

impl LogLine {
    /// Trim `text` and wrap it. Returns `None` when nothing is left.
    ///
    /// Interior line terminators are not allowed; callers split on `\n`
    /// before building lines, and a stray `\n` in the middle yields `None`.
    /// A bare `\r` inside the text (progress bars) is kept as-is.
    pub fn new(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.contains('\n') {
            return None;
        }
        Some(Self(Arc::from(trimmed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LogLine").field(&&*self.0).finish()
    }
}

impl AsRef<str> for LogLine {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<LogLine> for String {
    fn from(line: LogLine) -> Self {
        line.0.to_string()
    }
}
