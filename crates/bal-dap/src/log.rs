use std::io::{self, Write};

use crossbeam_channel::{Receiver, Sender};
use tracing_subscriber::fmt::MakeWriter;

/// Routes formatted log records to the IDE's debug console.
///
/// Stdout carries the protocol stream, so records travel over a channel to the
/// dispatcher, which turns them into `output` events.
pub struct DebugConsoleWriter {
    sender: Sender<String>,
}

impl DebugConsoleWriter {
    pub fn new() -> (Self, Receiver<String>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { sender: tx }, rx)
    }
}

impl<'a> MakeWriter<'a> for DebugConsoleWriter {
    type Writer = ConsoleRecord;

    fn make_writer(&'a self) -> Self::Writer {
        ConsoleRecord {
            buffer: Vec::new(),
            sender: self.sender.clone(),
        }
    }
}

/// One log record. The formatter may write it in several pieces; it reaches
/// the console as a single message when the record is dropped.
pub struct ConsoleRecord {
    buffer: Vec<u8>,
    sender: Sender<String>,
}

impl Write for ConsoleRecord {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ConsoleRecord {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let message = String::from_utf8_lossy(&self.buffer).into_owned();
        if let Err(e) = self.sender.send(message) {
            // The dispatcher is gone; stderr is still safe to write to.
            let _ = io::stderr().write_all(e.0.as_bytes());
        }
    }
}
