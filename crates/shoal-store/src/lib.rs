//! # shoal-store
//!
//! Local cache store for remote files.
//!
//! One [`CacheController`] governs one cached file: it materializes a
//! remote byte stream into a local entry directory, publishes bytes to
//! concurrent readers as they become durable, and records enough metadata
//! to recover the entry after a restart. The [`CacheRegistry`] owns the
//! controllers, keeps the cache-wide byte total, and runs the recovery
//! scan at startup.
//!
//! ## Entry directory layout
//!
//! ```text
//! <cache_root>/<blake3(remote_path, version)>/
//! ├── data.bin       # raw bytes, prefix-consistent with the remote file
//! ├── metadata.txt   # descriptor blob, written by its metadata class
//! └── info.txt       # { file_status, metadata_class }
//! ```

pub mod controller;
pub mod reader;
pub mod registry;
pub mod sink;
pub mod status;
pub mod task_pool;

pub use controller::{ByteSource, CacheController, WaitResult};
pub use reader::ReaderHandle;
pub use registry::{CacheAccounting, CacheRegistry, NullAccounting};
pub use sink::DataSink;
pub use status::{LocalFileInfo, LocalFileStatus};
pub use task_pool::{TaskHandle, TaskPool};

use thiserror::Error;

/// Name of the raw byte file inside an entry directory.
pub const DATA_FILE: &str = "data.bin";
/// Name of the descriptor blob inside an entry directory.
pub const METADATA_FILE: &str = "metadata.txt";
/// Name of the lifecycle record inside an entry directory.
pub const INFO_FILE: &str = "info.txt";

/// Errors that can occur during cache store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad arguments: {0}")]
    BadArguments(String),

    #[error("logical error: {0}")]
    Logical(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
