use log::warn;
use std::io::Write;
use vm::CharacterSink;

/// Output port which writes characters to a byte stream
///
/// Write errors can't be reported to the VM, so they are logged (once) and
/// otherwise ignored.
pub struct Output<W: Write> {
    writer: W,

    /// Set after the first failed write, to avoid flooding the log
    failed: bool,
}

impl Output<std::io::Stdout> {
    /// Builds an output port which prints to `stdout`
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> Output<W> {
    /// Wraps the given writer
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
        }
    }

    /// Flushes the underlying writer
    pub fn flush(&mut self) {
        let r = self.writer.flush();
        self.check(r);
    }

    /// Shared borrow of the underlying writer
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    fn check(&mut self, r: std::io::Result<()>) {
        if let Err(e) = r {
            if !self.failed {
                warn!("failed to write output: {e}");
                self.failed = true;
            }
        }
    }
}

impl<W: Write> CharacterSink for Output<W> {
    fn write(&mut self, c: u16) {
        let b = u8::try_from(c).unwrap_or_else(|_| {
            warn!("cannot print character code {c}");
            b'?'
        });
        let r = self.writer.write_all(&[b]);
        self.check(r);
    }
}

impl<W: Write> Drop for Output<W> {
    fn drop(&mut self) {
        self.flush();
    }
}
