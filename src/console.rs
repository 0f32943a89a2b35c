//! Operator console output
//!
//! Status lines go to stdout through a [`StatusSink`]; logs go to stderr. Both end lines with
//! `\r\n` because the terminal sits in raw mode while the key reader waits, and a bare `\n`
//! would leave the cursor in the wrong column.

use std::io::{self, Write};
use std::sync::Mutex;

/// Destination for human readable status lines
pub trait StatusSink: Send + Sync {
    fn status(&self, line: &str);
}

/// Writes status lines to stdout
#[derive(Debug, Default)]
pub struct TerminalConsole {
    lock: Mutex<()>,
}

impl TerminalConsole {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusSink for TerminalConsole {
    fn status(&self, line: &str) {
        // Serializes lines from the dispatch loop and the transport task
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = io::stdout().lock();
        let _ = write!(out, "{line}\r\n");
        let _ = out.flush();
    }
}

/// `io::Write` adapter that expands `\n` to `\r\n`
pub struct RawSafeWriter<W: Write> {
    inner: W,
}

impl<W: Write> RawSafeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl RawSafeWriter<io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write> Write for RawSafeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut start = 0;
        for (idx, byte) in buf.iter().enumerate() {
            if *byte == b'\n' && (idx == 0 || buf[idx - 1] != b'\r') {
                self.inner.write_all(&buf[start..idx])?;
                self.inner.write_all(b"\r\n")?;
                start = idx + 1;
            }
        }
        self.inner.write_all(&buf[start..])?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Collects status lines in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CapturedConsole {
    lines: Mutex<Vec<String>>,
}

#[cfg(test)]
impl CapturedConsole {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

#[cfg(test)]
impl StatusSink for CapturedConsole {
    fn status(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_safe_writer_expands_newlines() {
        let mut out = RawSafeWriter::new(Vec::new());
        out.write_all(b"one\ntwo\r\nthree\n").unwrap();
        assert_eq!(out.inner, b"one\r\ntwo\r\nthree\r\n");
    }

    #[test]
    fn raw_safe_writer_passes_plain_text() {
        let mut out = RawSafeWriter::new(Vec::new());
        out.write_all(b"no newline").unwrap();
        assert_eq!(out.inner, b"no newline");
    }
}
