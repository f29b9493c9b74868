//! Device message log.
//!
//! Appends one line per driver `message` attribute to a file named after the
//! message's date: `<dir>/<YYYY-MM-DD>.islog`. The file of the most recent
//! day stays open, so consecutive records cost one write each.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Appender for device message records.
#[derive(Debug)]
pub struct DeviceLog {
    dir: PathBuf,
    /// Currently open daily file
    current: Option<(PathBuf, File)>,
}

impl DeviceLog {
    /// Log into `dir`, which must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), current: None }
    }

    /// Log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a record with `timestamp` goes to.
    pub fn file_for(&self, timestamp: &str) -> PathBuf {
        let day: String = timestamp.chars().take(10).map(|c| if c == '/' { '_' } else { c }).collect();
        self.dir.join(format!("{day}.islog"))
    }

    /// Append `timestamp: device: message`. A missing timestamp means now
    /// (UTC).
    pub fn record(&mut self, device: &str, timestamp: Option<&str>, message: &str) -> io::Result<PathBuf> {
        let timestamp = match timestamp {
            Some(ts) => ts.to_string(),
            None => chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        };
        let path = self.file_for(&timestamp);
        let file = self.open(&path)?;
        if let Err(e) = writeln!(file, "{timestamp}: {device}: {message}") {
            self.current = None;
            return Err(e);
        }
        Ok(path)
    }

    /// Whether a daily file is held open.
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    fn open(&mut self, path: &Path) -> io::Result<&mut File> {
        if self.current.as_ref().is_none_or(|(open, _)| open != path) {
            self.current = None;
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            self.current = Some((path.to_path_buf(), file));
        }
        match &mut self.current {
            Some((_, file)) => Ok(file),
            None => Err(io::Error::other("device log file not open")),
        }
    }
}
