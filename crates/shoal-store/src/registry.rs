//! Process-wide registry of cache controllers.
//!
//! The registry owns one [`CacheController`] per remote path, keeps the
//! cache-wide byte total, runs the startup recovery scan, and hands the
//! shared task pool to controllers starting a download. Entry
//! directories are named by the BLAKE3 hash of the remote path and
//! version token, so arbitrary remote paths map onto safe local
//! directory names and a replacement never shares a directory with the
//! entry it retires.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use shoal_metadata::{MetadataFactory, RemoteFileMetadata};

use crate::controller::{ByteSource, CacheController};
use crate::status::LocalFileStatus;
use crate::task_pool::TaskPool;
use crate::Result;

/// Byte accounting seam between controllers and their owner.
///
/// The registry implements it; tests inject fakes instead of mutating
/// process-wide state.
pub trait CacheAccounting: Send + Sync {
    /// Adjust the cache-wide byte total by `delta`.
    fn update_total_size(&self, delta: i64);
}

/// Accounting sink that discards updates, for standalone controllers.
#[derive(Debug, Default)]
pub struct NullAccounting;

impl CacheAccounting for NullAccounting {
    fn update_total_size(&self, _delta: i64) {}
}

#[derive(Debug, Default)]
struct TotalBytes(AtomicI64);

impl CacheAccounting for TotalBytes {
    fn update_total_size(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Map from remote path to controller, plus total-bytes accounting.
pub struct CacheRegistry {
    root: PathBuf,
    flush_threshold: u64,
    entries: DashMap<String, Arc<CacheController>>,
    total_bytes: Arc<TotalBytes>,
    pool: TaskPool,
}

impl CacheRegistry {
    /// Create a registry rooted at `root` (created if absent).
    pub fn new(root: impl Into<PathBuf>, flush_threshold: u64, pool_threads: Option<usize>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            flush_threshold,
            entries: DashMap::new(),
            total_bytes: Arc::new(TotalBytes::default()),
            pool: TaskPool::new("shoal-download", pool_threads),
        })
    }

    /// Build a registry from configuration.
    pub fn from_config(config: &shoal_config::Config) -> Result<Self> {
        Self::new(
            config.storage.cache_root.clone(),
            config.download.flush_threshold,
            config.download.pool_threads,
        )
    }

    /// Scan the cache root, recover completed entries, and delete the
    /// rest. Returns the number of recovered entries.
    ///
    /// Deletion happens after the directory walk completes; removing
    /// entries mid-iteration would invalidate the iterator.
    pub fn recover_all(&self, factory: &MetadataFactory) -> Result<usize> {
        let mut invalid: Vec<PathBuf> = Vec::new();
        let mut recovered = 0usize;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            match CacheController::recover(
                &path,
                factory,
                self.flush_threshold,
                self.accounting(),
            ) {
                Ok(Some(controller)) => {
                    let key = controller.metadata().remote_path().to_string();
                    if self.entries.contains_key(&key) {
                        // A second directory for the same remote path can
                        // be left behind by a crash mid-replacement; keep
                        // the first and clean up the duplicate.
                        warn!(
                            remote_path = %key,
                            path = %path.display(),
                            "duplicate cached entry will be removed"
                        );
                        self.total_bytes
                            .update_total_size(-(controller.current_offset() as i64));
                        invalid.push(path);
                        continue;
                    }
                    debug!(
                        remote_path = %key,
                        path = %path.display(),
                        "recovered cached entry"
                    );
                    self.entries.insert(key, controller);
                    recovered += 1;
                }
                Ok(None) => invalid.push(path),
                Err(err) => {
                    error!(path = %path.display(), %err, "cached entry is invalid and will be removed");
                    invalid.push(path);
                }
            }
        }

        for path in invalid {
            if let Err(err) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), %err, "failed to remove invalid cached entry");
            }
        }

        info!(recovered, root = %self.root.display(), "cache recovery scan complete");
        Ok(recovered)
    }

    /// Controller for `remote_path`, if one is cached.
    pub fn lookup(&self, remote_path: &str) -> Option<Arc<CacheController>> {
        self.entries.get(remote_path).map(|e| Arc::clone(e.value()))
    }

    /// Return the cached controller for `metadata`'s remote path, or
    /// create one and start its download from `source`.
    ///
    /// Miss, create, and insert happen under the map entry, so two
    /// threads racing on the same uncached path agree on one controller
    /// and one download. An existing entry cached under a different
    /// version token is replaced in place and then retired.
    pub fn get_or_create(
        &self,
        metadata: Arc<dyn RemoteFileMetadata>,
        source: ByteSource,
    ) -> Result<Arc<CacheController>> {
        let (controller, replaced) = match self.entries.entry(metadata.remote_path().to_string())
        {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_stale(metadata.as_ref()) {
                    return Ok(Arc::clone(occupied.get()));
                }
                info!(
                    remote_path = %metadata.remote_path(),
                    old_version = %occupied.get().metadata().version(),
                    new_version = %metadata.version(),
                    "cached entry is stale; replacing"
                );
                let controller = self.create_entry(&metadata, source)?;
                let old = occupied.insert(Arc::clone(&controller));
                (controller, Some(old))
            }
            Entry::Vacant(vacant) => {
                let controller = self.create_entry(&metadata, source)?;
                vacant.insert(Arc::clone(&controller));
                (controller, None)
            }
        };

        // Retire the replaced entry with the map entry released: closing
        // blocks on reader drain, and the fresh entry lives in its own
        // directory, so the old one can disappear at its own pace.
        if let Some(old) = replaced {
            self.retire(&old)?;
        }
        Ok(controller)
    }

    fn create_entry(
        &self,
        metadata: &Arc<dyn RemoteFileMetadata>,
        source: ByteSource,
    ) -> Result<Arc<CacheController>> {
        let dir = self.entry_dir(metadata.as_ref());
        let controller = CacheController::new(
            Arc::clone(metadata),
            dir,
            self.flush_threshold,
            self.accounting(),
        )?;
        controller.start_background_download(source, &self.pool)?;
        Ok(controller)
    }

    /// Close and delete the entry for `remote_path`, if any. Blocks
    /// until the entry's readers drain.
    pub fn remove(&self, remote_path: &str) -> Result<()> {
        if let Some((_, controller)) = self.entries.remove(remote_path) {
            self.retire(&controller)?;
        }
        Ok(())
    }

    fn retire(&self, controller: &Arc<CacheController>) -> Result<()> {
        // Bytes enter the total on completion or recovery only, so only
        // a completed entry has anything to give back.
        let bytes = if controller.file_status() == LocalFileStatus::Downloaded {
            controller.current_offset()
        } else {
            0
        };
        controller.close()?;
        if bytes > 0 {
            self.total_bytes.update_total_size(-(bytes as i64));
        }
        Ok(())
    }

    /// Total bytes currently accounted to completed cached entries.
    pub fn total_bytes(&self) -> i64 {
        self.total_bytes.0.load(Ordering::Relaxed)
    }

    /// Number of live controllers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accounting handle controllers report through.
    pub fn accounting(&self) -> Arc<dyn CacheAccounting> {
        Arc::clone(&self.total_bytes) as Arc<dyn CacheAccounting>
    }

    /// Shared pool controllers schedule their downloads on.
    pub fn task_pool(&self) -> &TaskPool {
        &self.pool
    }

    /// Entry directories hash the remote path and the version token
    /// together: replacing a stale entry lands in a fresh directory, so
    /// retiring the old one never touches the new download.
    fn entry_dir(&self, metadata: &dyn RemoteFileMetadata) -> PathBuf {
        let mut hasher = blake3::Hasher::new();
        hasher.update(metadata.remote_path().as_bytes());
        hasher.update(b"\0");
        hasher.update(metadata.version().as_bytes());
        self.root.join(hasher.finalize().to_hex().as_str())
    }
}

impl CacheAccounting for CacheRegistry {
    fn update_total_size(&self, delta: i64) {
        self.total_bytes.update_total_size(delta);
    }
}
