//! Byte transport between connections and the routing loop.
//!
//! Every client socket, driver pipe pair and remote link becomes a [`Link`]:
//! a reader task that forwards raw bytes as [`BrokerEvent::Received`] and a
//! writer task that writes chunks handed out by the broker and acknowledges
//! each one with [`BrokerEvent::Written`]. Neither task looks at the bytes.

use std::{io, path::Path};

use bytes::{Bytes, BytesMut};
use skyrelay_core::{ConnId, RemoteLaunch};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UnixListener},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::broker::BrokerEvent;

/// Size of one socket or pipe read.
pub const READ_BUFFER_SIZE: usize = 49152;

/// Event sender shared by every task that reports to the routing loop.
pub(crate) type EventSender = mpsc::UnboundedSender<BrokerEvent>;

/// I/O tasks serving one connection.
#[derive(Debug)]
pub(crate) struct Link {
    chunks: mpsc::UnboundedSender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
    kill: Option<oneshot::Sender<()>>,
}

impl Link {
    /// Start reader and writer tasks for `conn`.
    pub(crate) fn spawn<R, W>(conn: ConnId, reader: R, writer: W, events: &EventSender) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (chunks, pending) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(read_loop(conn, reader, events.clone())),
            tokio::spawn(write_loop(conn, writer, pending, events.clone())),
        ];
        Self { chunks, tasks, kill: None }
    }

    /// Keep `task` alive as long as the link.
    pub(crate) fn attach_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Signal `kill` when the link is closed.
    pub(crate) fn on_close(&mut self, kill: oneshot::Sender<()>) {
        self.kill = Some(kill);
    }

    /// Hand one chunk to the writer. Returns false if the writer is gone.
    pub(crate) fn send(&self, chunk: Bytes) -> bool {
        self.chunks.send(chunk).is_ok()
    }

    /// Stop every task and drop both stream halves.
    pub(crate) fn close(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_loop<R>(conn: ConnId, mut reader: R, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let event = match reader.read_buf(&mut buf).await {
            Ok(0) => BrokerEvent::Disconnected { conn, reason: "EOF".to_string() },
            Ok(_) => {
                let data = buf.split().freeze();
                if events.send(BrokerEvent::Received { conn, data }).is_err() {
                    return;
                }
                continue;
            },
            Err(e) => BrokerEvent::Disconnected { conn, reason: format!("read error: {e}") },
        };
        let _ = events.send(event);
        return;
    }
}

async fn write_loop<W>(
    conn: ConnId,
    mut writer: W,
    mut pending: mpsc::UnboundedReceiver<Bytes>,
    events: EventSender,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = pending.recv().await {
        let result = match writer.write_all(&chunk).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        let event = match result {
            Ok(()) => BrokerEvent::Written { conn, n: chunk.len() },
            Err(e) => BrokerEvent::Disconnected { conn, reason: format!("write error: {e}") },
        };
        let failed = matches!(event, BrokerEvent::Disconnected { .. });
        if events.send(event).is_err() || failed {
            return;
        }
    }
}

/// Connect to a remote broker and start a link for it.
pub(crate) async fn connect_remote(conn: ConnId, remote: &RemoteLaunch, events: &EventSender) -> io::Result<Link> {
    let stream = TcpStream::connect((remote.host.as_str(), remote.port)).await?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    Ok(Link::spawn(conn, reader, writer, events))
}

/// Bind the local socket listener.
///
/// On Linux the path names a socket in the abstract namespace, so no file is
/// created. Elsewhere a stale socket file at `path` is replaced.
pub(crate) fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    #[cfg(target_os = "linux")]
    let listener = {
        use std::os::{linux::net::SocketAddrExt, unix::ffi::OsStrExt};

        let addr = std::os::unix::net::SocketAddr::from_abstract_name(path.as_os_str().as_bytes())?;
        std::os::unix::net::UnixListener::bind_addr(&addr)?
    };

    #[cfg(not(target_os = "linux"))]
    let listener = {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        std::os::unix::net::UnixListener::bind(path)?
    };

    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}
