//! Lifecycle status record persisted as `info.txt`.
//!
//! The record is the crash-consistency anchor of an entry: recovery only
//! accepts a directory whose record parses and reads `Downloaded`. The
//! write path goes through a unique temp file plus rename so a torn write
//! can never promote a partial entry.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, INFO_FILE};

/// Download lifecycle of a cached entry. Transitions are one-way:
/// `ToDownload → Downloading → Downloaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LocalFileStatus {
    ToDownload = 0,
    Downloading = 1,
    Downloaded = 2,
}

impl LocalFileStatus {
    /// Wire code stored in `info.txt`.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::ToDownload),
            1 => Some(Self::Downloading),
            2 => Some(Self::Downloaded),
            _ => None,
        }
    }
}

/// On-disk JSON shape: integer status code plus the metadata class name.
#[derive(Debug, Serialize, Deserialize)]
struct InfoRecord {
    file_status: u8,
    metadata_class: String,
}

/// Parsed contents of an entry's `info.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileInfo {
    pub file_status: LocalFileStatus,
    pub metadata_class: String,
}

impl LocalFileInfo {
    pub fn new(file_status: LocalFileStatus, metadata_class: impl Into<String>) -> Self {
        Self {
            file_status,
            metadata_class: metadata_class.into(),
        }
    }

    /// Atomically persist the record into `dir/info.txt`.
    ///
    /// Write to a unique temp name, fsync, then rename over the final
    /// path. Readers observe either the previous record or this one.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let record = InfoRecord {
            file_status: self.file_status.code(),
            metadata_class: self.metadata_class.clone(),
        };
        let payload = serde_json::to_string(&record)?;

        let final_path = dir.join(INFO_FILE);
        let temp_name = format!(
            "{}.{}.{:?}.tmp",
            INFO_FILE,
            std::process::id(),
            std::thread::current().id()
        );
        let temp_path = dir.join(temp_name);

        let mut file = File::create(&temp_path)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;

        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Load the record from `dir/info.txt`.
    ///
    /// A missing file, malformed JSON, or an unknown status code all mean
    /// the same thing to recovery: no recoverable state.
    pub fn load(dir: &Path) -> Option<Self> {
        let contents = fs::read_to_string(dir.join(INFO_FILE)).ok()?;
        let record: InfoRecord = serde_json::from_str(&contents).ok()?;
        let file_status = LocalFileStatus::from_code(record.file_status)?;
        Some(Self {
            file_status,
            metadata_class: record.metadata_class,
        })
    }
}
