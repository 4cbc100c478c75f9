use std::sync::Arc;

use crate::line::LogLine;

/// Destination for completed log lines.
///
/// Producers (the stream tee and the tracing adapter) hand every line they
/// assemble to a `LineSink`. Implementations must contain their own failures:
/// `emit` has no error channel, so nothing on the remote path can surface to
/// the code that produced the line.
pub trait LineSink: Send + Sync {
    fn emit(&self, line: LogLine);
}

impl<T: LineSink + ?Sized> LineSink for Arc<T> {
    fn emit(&self, line: LogLine) {
        (**self).emit(line);
    }
}

impl<T: LineSink + ?Sized> LineSink for &T {
    fn emit(&self, line: LogLine) {
        (**self).emit(line);
    }
}

/// Sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl LineSink for NullSink {
    fn emit(&self, _line: LogLine) {}
}

/// In-memory sink that records every line, for tests and local inspection.
#[derive(Clone, Debug, Default)]
pub struct CollectingSink {
    lines: Arc<std::sync::Mutex<Vec<LogLine>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every line emitted so far, in emission order.
    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().map(|l| l.as_str().to_owned()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogLine>> {
        match self.lines.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LineSink for CollectingSink {
    fn emit(&self, line: LogLine) {
        self.lock().push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.emit(LogLine::new("one").unwrap());
        sink.emit(LogLine::new("two").unwrap());
        assert_eq!(sink.lines(), vec!["one", "two"]);
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn arc_forwards_to_inner() {
        let sink = CollectingSink::new();
        let shared: Arc<dyn LineSink> = Arc::new(sink.clone());
        shared.emit(LogLine::new("via arc").unwrap());
        assert_eq!(sink.lines(), vec!["via arc"]);
    }

    #[test]
    fn null_sink_accepts_anything() {
        NullSink.emit(LogLine::new("dropped").unwrap());
    }
}
