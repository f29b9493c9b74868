//! Control channel reader.
//!
//! Reads newline-terminated commands from a FIFO and forwards each parsed
//! [`ControlCommand`] to the routing loop. Bad lines are logged and skipped.
//! On EOF or a read error the FIFO is reopened.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use skyrelay_core::ControlCommand;
use tokio::{
    io::AsyncReadExt,
    net::unix::pipe,
    task::JoinHandle,
};

use crate::{broker::BrokerEvent, transport::EventSender};

/// Longest accepted control line, newline included.
pub const MAX_CONTROL_LINE: usize = 1024;

const REOPEN_DELAY: Duration = Duration::from_millis(100);

/// Accumulates bytes and splits them into lines.
#[derive(Debug)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl LineBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self { buf: Vec::with_capacity(limit), limit }
    }

    /// Append `data` and move every complete line into `lines`.
    ///
    /// Returns true if the unterminated remainder reached the limit, in which
    /// case it has been discarded.
    pub(crate) fn push(&mut self, data: &[u8], lines: &mut Vec<String>) -> bool {
        self.buf.extend_from_slice(data);
        while let Some(end) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line[..end]).into_owned());
        }
        if self.buf.len() >= self.limit.saturating_sub(1) {
            self.buf.clear();
            return true;
        }
        false
    }

    /// Take the unterminated remainder, if any.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}

/// Open the FIFO and start reading it.
///
/// Failing to open at startup is an error; later reopen failures end the
/// reader.
pub(crate) fn spawn_control(path: PathBuf, events: EventSender) -> io::Result<JoinHandle<()>> {
    let receiver = open_fifo(&path)?;
    tracing::info!("control channel on {}", path.display());
    Ok(tokio::spawn(control_loop(path, receiver, events)))
}

fn open_fifo(path: &Path) -> io::Result<pipe::Receiver> {
    let mut options = pipe::OpenOptions::new();
    // Holding a write end keeps the FIFO from reporting EOF between writers.
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options.open_receiver(path)
}

async fn control_loop(path: PathBuf, mut receiver: pipe::Receiver, events: EventSender) {
    let mut buffer = LineBuffer::new(MAX_CONTROL_LINE);
    let mut chunk = vec![0u8; MAX_CONTROL_LINE];

    loop {
        let mut lines = Vec::new();
        let reopen = match receiver.read(&mut chunk).await {
            Ok(0) => {
                lines.extend(buffer.finish());
                true
            },
            Ok(n) => {
                let overflow = buffer.push(&chunk[..n], &mut lines);
                if overflow {
                    tracing::warn!("control line longer than {MAX_CONTROL_LINE} bytes discarded");
                }
                overflow
            },
            Err(e) => {
                tracing::warn!("control channel read error: {e}");
                true
            },
        };

        for line in lines {
            if !dispatch(&line, &events) {
                return;
            }
        }

        if reopen {
            buffer.finish();
            tokio::time::sleep(REOPEN_DELAY).await;
            receiver = match open_fifo(&path) {
                Ok(receiver) => receiver,
                Err(e) => {
                    tracing::error!("reopen {}: {e}", path.display());
                    return;
                },
            };
        }
    }
}

/// Parse and forward one line. Returns false once the routing loop is gone.
fn dispatch(line: &str, events: &EventSender) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    match ControlCommand::parse(line) {
        Ok(command) => {
            tracing::debug!("control: {command:?}");
            events.send(BrokerEvent::Control(command)).is_ok()
        },
        Err(e) => {
            tracing::warn!("{e}");
            true
        },
    }
}
