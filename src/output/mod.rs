//! Output formatting and sinks for status reports.
//!
//! A formatter turns a [`StatusReport`] into one line of text; the run loop
//! writes that line to stdout or appends it to a file.

pub mod json;

use crate::status::StatusReport;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Error type for formatting failures.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("failed to serialize status: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Trait for formatting status reports into output lines.
pub trait OutputFormatter: Send + Sync {
    /// Format a report as a single line, without the trailing newline.
    fn format(&self, report: &StatusReport) -> Result<String, OutputError>;
}

/// Writer that appends to a file, opening it anew for every write.
///
/// The file may be truncated, rotated or removed by other processes between
/// writes; each line lands in whatever file is at `path` at that moment.
#[derive(Debug, Clone)]
pub struct AppendFile {
    path: PathBuf,
}

impl AppendFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AppendFile { path: path.into() }
    }
}

impl Write for AppendFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
