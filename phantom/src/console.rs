//! Console relay: script log messages to standard output.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// Format a console message, prefixing `source:line` when a source is known.
pub fn format_message(message: &str, line: usize, source: &str) -> String {
    if source.is_empty() {
        message.to_string()
    } else {
        format!("{source}:{line} {message}")
    }
}

/// Line-oriented, unbuffered sink for script console output.
///
/// Cloning shares the underlying writer.
#[derive(Clone)]
pub struct ConsoleRelay {
    sink: Rc<RefCell<Box<dyn Write>>>,
}

impl ConsoleRelay {
    pub fn stdout() -> Self {
        Self::with_writer(io::stdout())
    }

    pub fn with_writer(writer: impl Write + 'static) -> Self {
        Self {
            sink: Rc::new(RefCell::new(Box::new(writer))),
        }
    }

    /// Relay one message. Empty `source` means no annotation.
    pub fn message(&self, message: &str, line: usize, source: &str) {
        self.write_line(&format_message(message, line, source));
    }

    /// Write a raw line (version string, usage text).
    pub fn write_line(&self, text: &str) {
        let mut sink = self.sink.borrow_mut();
        let _ = writeln!(sink, "{text}");
        let _ = sink.flush();
    }
}

impl Default for ConsoleRelay {
    fn default() -> Self {
        Self::stdout()
    }
}

/// In-memory writer whose clones share one buffer. Used to capture relayed
/// output when embedding the host.
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
