//! Output tee: forward bytes to the original writer untouched and turn the
//! complete lines found in them into [`LogLine`]s for a [`LineSink`].
//!
//! Only text that has seen its `\n` terminator is ever emitted. A trailing
//! fragment stays buffered until a later write completes it; flushing or
//! dropping the tee never forces it out.

use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use logcast_core::{LineSink, LogLine};
use parking_lot::Mutex;

/// Reassembles complete lines from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return the non-blank lines it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LogLine> {
        // `pending` holds no terminator between calls, so only the new chunk
        // needs scanning.
        let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') else {
            self.pending.extend_from_slice(chunk);
            return Vec::new();
        };

        let mut complete = std::mem::take(&mut self.pending);
        complete.extend_from_slice(&chunk[..pos]);
        self.pending.extend_from_slice(&chunk[pos + 1..]);

        complete
            .split(|&b| b == b'\n')
            .filter_map(|raw| LogLine::new(&String::from_utf8_lossy(raw)))
            .collect()
    }

    /// The buffered, not yet terminated fragment.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

fn emit_all<S: LineSink + ?Sized>(sink: &S, lines: Vec<LogLine>) {
    for line in lines {
        if panic::catch_unwind(AssertUnwindSafe(|| sink.emit(line))).is_err() {
            eprintln!("logcast-telemetry: line sink panicked, line dropped");
        }
    }
}

/// Single-owner tee around a writer.
pub struct Tee<W, S> {
    inner: W,
    sink: S,
    assembler: LineAssembler,
}

impl<W: Write, S: LineSink> Tee<W, S> {
    pub fn new(inner: W, sink: S) -> Self {
        Self {
            inner,
            sink,
            assembler: LineAssembler::new(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap the original writer. Any buffered fragment is discarded.
    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn pending(&self) -> &[u8] {
        self.assembler.pending()
    }
}

impl<W: Write + IsTerminal, S> Tee<W, S> {
    pub fn is_terminal(&self) -> bool {
        self.inner.is_terminal()
    }
}

impl<W: Write, S: LineSink> Write for Tee<W, S> {
    /// Errors from the original writer are returned as-is. Only the bytes it
    /// accepted are fed to the line assembler.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        let lines = self.assembler.push(&buf[..n]);
        emit_all(&self.sink, lines);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct TeeState<W> {
    out: W,
    assembler: LineAssembler,
}

/// Writer over a locked [`TeeState`] that collects the lines it completes.
///
/// Lets a whole `write_all` or `write_fmt` run under one lock acquisition.
struct LockedWriter<'a, W> {
    state: &'a mut TeeState<W>,
    lines: Vec<LogLine>,
}

impl<W: Write> Write for LockedWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.state.out.write(buf)?;
        self.lines.extend(self.state.assembler.push(&buf[..n]));
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.out.flush()
    }
}

/// Cloneable tee shared by many threads writing to the same stream.
///
/// One assembler per stream. The lock covers the forward and the line
/// extraction only; lines are emitted after it is released, so a slow sink
/// never holds up other writers' local output. `write_all` and `write_fmt`
/// hold the lock for the whole call, so one `writeln!` is never interleaved
/// with another thread's output.
pub struct SharedTee<W, S> {
    state: Arc<Mutex<TeeState<W>>>,
    sink: S,
}

impl<W, S: Clone> Clone for SharedTee<W, S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            sink: self.sink.clone(),
        }
    }
}

impl<W: Write, S: LineSink> SharedTee<W, S> {
    pub fn new(out: W, sink: S) -> Self {
        Self {
            state: Arc::new(Mutex::new(TeeState {
                out,
                assembler: LineAssembler::new(),
            })),
            sink,
        }
    }

    pub fn pending(&self) -> Vec<u8> {
        self.state.lock().assembler.pending().to_vec()
    }

    fn write_shared(&self, buf: &[u8]) -> io::Result<usize> {
        let (n, lines) = {
            let mut state = self.state.lock();
            let n = state.out.write(buf)?;
            let lines = state.assembler.push(&buf[..n]);
            (n, lines)
        };
        emit_all(&self.sink, lines);
        Ok(n)
    }

    /// Run `f` against the locked stream, then emit what it completed. Lines
    /// finished before a failure are still emitted.
    fn locked_shared(
        &self,
        f: impl FnOnce(&mut LockedWriter<'_, W>) -> io::Result<()>,
    ) -> io::Result<()> {
        let (result, lines) = {
            let mut state = self.state.lock();
            let mut writer = LockedWriter {
                state: &mut *state,
                lines: Vec::new(),
            };
            let result = f(&mut writer);
            (result, writer.lines)
        };
        emit_all(&self.sink, lines);
        result
    }

    fn flush_shared(&self) -> io::Result<()> {
        self.state.lock().out.flush()
    }
}

impl<W: Write + IsTerminal, S> SharedTee<W, S> {
    pub fn is_terminal(&self) -> bool {
        self.state.lock().out.is_terminal()
    }
}

impl<W: Write, S: LineSink> Write for SharedTee<W, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_shared(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.locked_shared(|w| w.write_all(buf))
    }

    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.locked_shared(|w| w.write_fmt(args))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_shared()
    }
}

impl<W: Write, S: LineSink> Write for &SharedTee<W, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_shared(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.locked_shared(|w| w.write_all(buf))
    }

    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.locked_shared(|w| w.write_fmt(args))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_shared()
    }
}

/// Tee over the process stdout.
pub fn stdout<S: LineSink>(sink: S) -> SharedTee<io::Stdout, S> {
    SharedTee::new(io::stdout(), sink)
}

/// Tee over the process stderr.
pub fn stderr<S: LineSink>(sink: S) -> SharedTee<io::Stderr, S> {
    SharedTee::new(io::stderr(), sink)
}
