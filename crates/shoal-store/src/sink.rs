//! Append-only writer over an entry's `data.bin`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Append-only data writer with an explicit durability barrier.
///
/// The sink tracks no positions; the controller owns the logical
/// published offset. Only the download task ever writes through a sink,
/// so the file descriptor is not shared.
#[derive(Debug)]
pub struct DataSink {
    file: File,
}

impl DataSink {
    /// Create (or truncate) the data file at `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Append `bytes` with no durability promise.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    /// Flush kernel buffers; bytes appended so far survive a crash.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}
