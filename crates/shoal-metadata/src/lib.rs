//! # shoal-metadata
//!
//! Remote-file descriptors and the metadata class factory for Shoal.
//!
//! Every cached entry records which *metadata class* produced it. A class
//! knows how to serialize a descriptor into the entry's `metadata.txt` and
//! how to parse it back on recovery. Classes are registered by name in a
//! [`MetadataFactory`]; an unknown class name is a hard error, so recovery
//! can refuse entries written by a class this build does not carry.
//!
//! Round-trip `parse(serialize(d)) == d` must hold for every class.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("unknown metadata class: {0}")]
    UnknownClass(String),

    #[error("cannot parse metadata for class {class}: {reason}")]
    Parse { class: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Descriptor of one remote file.
///
/// Implementations are immutable values; the cache never mutates a
/// descriptor after construction.
pub trait RemoteFileMetadata: fmt::Debug + Send + Sync {
    /// Registered class name, also persisted in the entry's `info.txt`.
    fn class_name(&self) -> &str;

    /// Path of the file on the remote side.
    fn remote_path(&self) -> &str;

    /// Total size of the remote file in bytes.
    fn file_size(&self) -> u64;

    /// Opaque version token. Two descriptors refer to the same remote
    /// content iff their tokens compare equal.
    fn version(&self) -> &str;

    /// Serialize to the text blob stored in `metadata.txt`.
    fn to_text(&self) -> String;
}

/// Parser for one metadata class: text blob → descriptor.
///
/// The error string is a human-readable reason; the factory wraps it into
/// [`MetadataError::Parse`] with the class name attached.
pub type MetadataParser =
    fn(&str) -> std::result::Result<Arc<dyn RemoteFileMetadata>, String>;

/// Class name → parser map.
///
/// A process normally uses the [`factory()`] singleton, but tests can build
/// private instances to avoid mutating global state.
#[derive(Default)]
pub struct MetadataFactory {
    classes: RwLock<HashMap<String, MetadataParser>>,
}

impl MetadataFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `parser` under `class_name`, replacing any previous entry.
    pub fn register(&self, class_name: &str, parser: MetadataParser) {
        self.classes
            .write()
            .unwrap()
            .insert(class_name.to_string(), parser);
    }

    /// Look up the parser for `class_name`.
    pub fn get(&self, class_name: &str) -> Result<MetadataParser> {
        self.classes
            .read()
            .unwrap()
            .get(class_name)
            .copied()
            .ok_or_else(|| MetadataError::UnknownClass(class_name.to_string()))
    }

    /// Parse `blob` with the parser registered for `class_name`.
    pub fn parse(&self, class_name: &str, blob: &str) -> Result<Arc<dyn RemoteFileMetadata>> {
        let parser = self.get(class_name)?;
        parser(blob).map_err(|reason| MetadataError::Parse {
            class: class_name.to_string(),
            reason,
        })
    }

    /// Registered class names, for diagnostics.
    pub fn class_names(&self) -> Vec<String> {
        self.classes.read().unwrap().keys().cloned().collect()
    }
}

/// Process-wide factory with the built-in classes pre-registered.
static GLOBAL_FACTORY: Lazy<MetadataFactory> = Lazy::new(|| {
    let factory = MetadataFactory::new();
    factory.register(FILE_CLASS, parse_file_metadata);
    factory
});

/// Global factory instance.
pub fn factory() -> &'static MetadataFactory {
    &GLOBAL_FACTORY
}

/// Class name of the built-in JSON-backed descriptor.
pub const FILE_CLASS: &str = "file";

/// Built-in descriptor class serialized as a small JSON record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub remote_path: String,
    pub file_size: u64,
    pub version: String,
}

impl FileMetadata {
    pub fn new(
        remote_path: impl Into<String>,
        file_size: u64,
        version: impl Into<String>,
    ) -> Self {
        Self {
            remote_path: remote_path.into(),
            file_size,
            version: version.into(),
        }
    }
}

impl RemoteFileMetadata for FileMetadata {
    fn class_name(&self) -> &str {
        FILE_CLASS
    }

    fn remote_path(&self) -> &str {
        &self.remote_path
    }

    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn to_text(&self) -> String {
        serde_json::to_string(self).expect("FileMetadata is always serializable")
    }
}

fn parse_file_metadata(blob: &str) -> std::result::Result<Arc<dyn RemoteFileMetadata>, String> {
    serde_json::from_str::<FileMetadata>(blob)
        .map(|meta| Arc::new(meta) as Arc<dyn RemoteFileMetadata>)
        .map_err(|e| e.to_string())
}
