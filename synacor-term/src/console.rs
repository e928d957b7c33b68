use log::{debug, warn};
use std::{
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    sync::mpsc,
};
use vm::CharacterSource;

/// Spawns a worker thread that listens on `stdin` and emits characters
///
/// The worker stops when `stdin` is closed or the receiver is dropped.
pub fn worker() -> mpsc::Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut i = std::io::stdin().lock();
        let mut buf = [0u8; 32];
        loop {
            let n = match i.read(&mut buf) {
                Ok(0) => {
                    debug!("stdin closed");
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("failed to read stdin: {e}");
                    return;
                }
            };
            for &c in &buf[..n] {
                if tx.send(c).is_err() {
                    return;
                }
            }
        }
    });
    rx
}

/// Input port which replays a script, then reads from a keystroke channel
///
/// Carriage returns are dropped, so programs only ever see `\n` line endings.
pub struct Console {
    script: VecDeque<u8>,
    rx: mpsc::Receiver<u8>,
}

impl Console {
    /// Builds a console reading from the given channel
    pub fn new(rx: mpsc::Receiver<u8>) -> Self {
        Self {
            script: VecDeque::new(),
            rx,
        }
    }

    /// Queues scripted input, which is read before the channel
    pub fn with_script(mut self, script: &[u8]) -> Self {
        self.script.extend(script);
        self
    }

    /// Returns the number of scripted bytes not yet read
    pub fn script_remaining(&self) -> usize {
        self.script.len()
    }

    fn next(&mut self) -> Option<u8> {
        if let Some(c) = self.script.pop_front() {
            return Some(c);
        }
        // We're about to block, so make sure that any prompt is visible
        if let Err(e) = std::io::stdout().flush() {
            debug!("failed to flush stdout: {e}");
        }
        self.rx.recv().ok()
    }
}

impl CharacterSource for Console {
    fn read(&mut self) -> Option<u16> {
        loop {
            let c = self.next()?;
            if c != b'\r' {
                return Some(u16::from(c));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn script_then_channel() {
        let (tx, rx) = mpsc::channel();
        let mut c = Console::new(rx).with_script(b"go\r\n");
        tx.send(b'x').unwrap();
        drop(tx);

        assert_eq!(c.script_remaining(), 4);
        assert_eq!(c.read(), Some(u16::from(b'g')));
        assert_eq!(c.read(), Some(u16::from(b'o')));
        assert_eq!(c.read(), Some(u16::from(b'\n')));
        assert_eq!(c.script_remaining(), 0);
        assert_eq!(c.read(), Some(u16::from(b'x')));
        assert_eq!(c.read(), None);
    }

    #[test]
    fn closed_channel() {
        let (tx, rx) = mpsc::channel::<u8>();
        drop(tx);
        let mut c = Console::new(rx);
        assert_eq!(c.read(), None);
    }
}
