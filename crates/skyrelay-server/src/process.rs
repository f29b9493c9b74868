//! Local driver subprocesses.
//!
//! The driver speaks the protocol on stdin/stdout. Its stderr is relayed to
//! the log one line at a time, and a watcher task reaps the process and logs
//! its exit status. Closing the link sends the kill signal to the watcher.

use std::{io, path::PathBuf, process::Stdio};

use skyrelay_core::{ConnId, LocalLaunch};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, Command},
    sync::oneshot,
};

use crate::transport::{EventSender, Link};

/// Where to find `launch`'s program.
///
/// A prefix wins. Otherwise a program starting with `.` is taken relative to
/// the broker's own directory, and anything else is looked up on `PATH`.
pub(crate) fn resolve_executable(launch: &LocalLaunch) -> PathBuf {
    if launch.prefix.is_none()
        && launch.program.starts_with('.')
        && let Some(dir) = std::env::current_exe().ok().as_deref().and_then(std::path::Path::parent)
    {
        return dir.join(&launch.program);
    }
    launch.executable()
}

/// Spawn the driver process for `conn` and start its link.
pub(crate) fn spawn_driver(conn: ConnId, launch: &LocalLaunch, events: &EventSender) -> io::Result<Link> {
    let executable = resolve_executable(launch);
    let mut command = Command::new(&executable);
    command
        .arg0(&launch.program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in launch.environment() {
        match value {
            Some(value) => command.env(key, value),
            None => command.env_remove(key),
        };
    }

    let mut child = command.spawn()?;
    let missing = |pipe: &str| io::Error::other(format!("{pipe} not captured"));
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    tracing::debug!("{conn} spawned {} (pid {:?})", executable.display(), child.id());

    let (kill, killed) = oneshot::channel();
    let mut link = Link::spawn(conn, stdout, stdin, events);
    link.attach_task(tokio::spawn(relay_stderr(launch.program.clone(), stderr)));
    // The watcher outlives the link on purpose: it still has to reap the child.
    tokio::spawn(watch(launch.program.clone(), child, killed));
    link.on_close(kill);
    Ok(link)
}

/// Log each stderr line under the driver's name.
async fn relay_stderr(program: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(driver = %program, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(driver = %program, "stderr: {e}");
                break;
            },
        }
    }
}

/// Wait for the process to exit, killing it first if the link closes.
async fn watch(program: String, mut child: Child, killed: oneshot::Receiver<()>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = killed => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(driver = %program, "kill: {e}");
            }
            child.wait().await
        },
    };

    match status {
        Ok(status) => match status.code() {
            Some(code) => tracing::info!(driver = %program, "exited with status {code}"),
            None => tracing::info!(driver = %program, "terminated by signal ({status})"),
        },
        Err(e) => tracing::warn!(driver = %program, "wait failed: {e}"),
    }
}
