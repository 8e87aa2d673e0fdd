//! Per-file cache controller.
//!
//! A controller owns the download state machine for one cached entry: it
//! appends remote bytes into `data.bin`, publishes the durable prefix to
//! waiting readers, persists the lifecycle record, and recovers completed
//! entries after a restart.
//!
//! All of `current_offset`, `file_status`, `valid`, and the open-reader
//! set mutate under a single mutex; `more_data` is the only wait
//! primitive and is always broadcast so every waiter re-evaluates its
//! predicate.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use shoal_metadata::{MetadataFactory, RemoteFileMetadata};

use crate::reader::ReaderHandle;
use crate::registry::CacheAccounting;
use crate::sink::DataSink;
use crate::status::{LocalFileInfo, LocalFileStatus};
use crate::task_pool::{TaskHandle, TaskPool};
use crate::{Result, StoreError, DATA_FILE, METADATA_FILE};

/// Read granularity of the download loop.
const DOWNLOAD_CHUNK: usize = 128 * 1024;

/// Blocking sequential byte source feeding a download.
pub type ByteSource = Box<dyn Read + Send>;

/// Outcome of a reader wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The requested range is published and durable.
    Ok,
    /// The download is complete and the range starts at or past the end.
    EndOfFile,
    /// The deadline passed before the range was published. State is
    /// unchanged; the caller may wait again.
    Timeout,
}

/// State guarded by the controller mutex.
struct Shared {
    file_status: LocalFileStatus,
    /// Bytes strictly below this offset are published and durable.
    current_offset: u64,
    open_readers: HashSet<u64>,
    valid: bool,
}

/// Coordinator for one cached remote file.
pub struct CacheController {
    metadata: Arc<dyn RemoteFileMetadata>,
    local_path: PathBuf,
    flush_threshold: u64,
    accounting: Arc<dyn CacheAccounting>,
    state: Mutex<Shared>,
    more_data: Condvar,
    next_reader_id: AtomicU64,
    download_task: Mutex<Option<TaskHandle>>,
}

impl CacheController {
    /// Create a fresh entry directory for `metadata`.
    ///
    /// The descriptor blob is written immediately so a later recovery can
    /// always attribute the metadata class, even if the download never
    /// starts.
    pub fn new(
        metadata: Arc<dyn RemoteFileMetadata>,
        local_path: impl Into<PathBuf>,
        flush_threshold: u64,
        accounting: Arc<dyn CacheAccounting>,
    ) -> Result<Arc<Self>> {
        let local_path = local_path.into();
        fs::create_dir_all(&local_path)?;
        fs::write(local_path.join(METADATA_FILE), metadata.to_text())?;

        Ok(Arc::new(Self {
            metadata,
            local_path,
            flush_threshold,
            accounting,
            state: Mutex::new(Shared {
                file_status: LocalFileStatus::ToDownload,
                current_offset: 0,
                open_readers: HashSet::new(),
                valid: true,
            }),
            more_data: Condvar::new(),
            next_reader_id: AtomicU64::new(0),
            download_task: Mutex::new(None),
        }))
    }

    /// Recover a controller from an existing entry directory.
    ///
    /// Returns `Ok(None)` when the directory holds no recoverable state
    /// (the caller is expected to schedule it for deletion). An unknown
    /// metadata class or an unparseable descriptor is an error so the
    /// caller can tell "nothing there" apart from "corrupt entry".
    pub fn recover(
        local_path: impl Into<PathBuf>,
        factory: &MetadataFactory,
        flush_threshold: u64,
        accounting: Arc<dyn CacheAccounting>,
    ) -> Result<Option<Arc<Self>>> {
        let local_path = local_path.into();

        if !local_path.join(DATA_FILE).exists() {
            trace!(path = %local_path.display(), "invalid cached directory");
            return Ok(None);
        }

        let Some(info) = LocalFileInfo::load(&local_path) else {
            info!(path = %local_path.display(), "recover cached file failed: unreadable lifecycle record");
            return Ok(None);
        };
        if info.file_status != LocalFileStatus::Downloaded {
            info!(path = %local_path.display(), "recover cached file failed: download was incomplete");
            return Ok(None);
        }

        let parser = factory.get(&info.metadata_class).map_err(|e| {
            error!(
                class = %info.metadata_class,
                path = %local_path.display(),
                "cannot resolve the metadata class; the cached file is invalid and will be removed"
            );
            StoreError::BadArguments(e.to_string())
        })?;

        let blob = fs::read_to_string(local_path.join(METADATA_FILE))?;
        let metadata = parser(&blob).map_err(|reason| {
            error!(
                path = %local_path.display(),
                "cannot load the metadata; the cached file is invalid and will be removed"
            );
            StoreError::Logical(format!(
                "invalid metadata file for class {}: {reason}",
                info.metadata_class
            ))
        })?;

        let data_len = fs::metadata(local_path.join(DATA_FILE))?.len();
        if data_len != metadata.file_size() {
            warn!(
                path = %local_path.display(),
                expected = metadata.file_size(),
                actual = data_len,
                "cached data size disagrees with its descriptor; entry rejected"
            );
            return Ok(None);
        }

        accounting.update_total_size(data_len as i64);

        Ok(Some(Arc::new(Self {
            metadata,
            local_path,
            flush_threshold,
            accounting,
            state: Mutex::new(Shared {
                file_status: LocalFileStatus::Downloaded,
                current_offset: data_len,
                open_readers: HashSet::new(),
                valid: true,
            }),
            more_data: Condvar::new(),
            next_reader_id: AtomicU64::new(0),
            download_task: Mutex::new(None),
        })))
    }

    pub fn metadata(&self) -> &Arc<dyn RemoteFileMetadata> {
        &self.metadata
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn file_status(&self) -> LocalFileStatus {
        self.state.lock().unwrap().file_status
    }

    pub fn current_offset(&self) -> u64 {
        self.state.lock().unwrap().current_offset
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().unwrap().valid
    }

    /// True iff `new_metadata` carries a different version token than the
    /// descriptor this entry was cached under.
    pub fn is_stale(&self, new_metadata: &dyn RemoteFileMetadata) -> bool {
        self.metadata.version() != new_metadata.version()
    }

    /// Begin pulling bytes from `source` on the shared task pool.
    ///
    /// Writes the lifecycle record before the first byte arrives, so a
    /// crash mid-download leaves at worst an incomplete entry that
    /// recovery rejects and cleans up.
    pub fn start_background_download(
        self: &Arc<Self>,
        source: ByteSource,
        pool: &TaskPool,
    ) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.file_status != LocalFileStatus::ToDownload {
                return Err(StoreError::BadArguments(format!(
                    "download already started for {}",
                    self.local_path.display()
                )));
            }
        }

        let mut sink = DataSink::create(&self.local_path.join(DATA_FILE))?;
        LocalFileInfo::new(LocalFileStatus::ToDownload, self.metadata.class_name())
            .store(&self.local_path)?;

        // The task holds no owning reference: it upgrades when it starts
        // running and drops the strong reference as soon as it returns.
        let controller = Arc::downgrade(self);
        let mut source = source;
        let name = format!("download {}", self.metadata.remote_path());
        let handle = pool.schedule(name, move |cancelled| {
            let Some(controller) = controller.upgrade() else {
                return;
            };
            controller.background_download(&mut *source, &mut sink, cancelled);
            // Joining from the worker itself would deadlock; the finished
            // task releases its own holder so a later drop finds nothing
            // left to join.
            controller.download_task.lock().unwrap().take();
        })?;
        *self.download_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn background_download(&self, source: &mut dyn Read, sink: &mut DataSink, cancelled: &AtomicBool) {
        if let Err(err) = self.download_loop(source, sink, cancelled) {
            error!(
                path = %self.local_path.display(),
                %err,
                "background download failed; entry marked invalid"
            );
            let mut state = self.state.lock().unwrap();
            state.valid = false;
            drop(state);
            self.more_data.notify_all();
        }
    }

    fn download_loop(
        &self,
        source: &mut dyn Read,
        sink: &mut DataSink,
        cancelled: &AtomicBool,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.file_status = LocalFileStatus::Downloading;
        }

        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        // Appended but not yet visible to readers.
        let mut total_bytes: u64 = 0;
        // Appended but not yet durable.
        let mut unflushed_bytes: u64 = 0;

        loop {
            if cancelled.load(Ordering::Acquire) {
                debug!(
                    path = %self.local_path.display(),
                    "download cancelled; partial entry stays unpromoted"
                );
                return Ok(());
            }

            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sink.append(&buf[..n])?;
            total_bytes += n as u64;
            unflushed_bytes += n as u64;

            if unflushed_bytes >= self.flush_threshold {
                let mut state = self.state.lock().unwrap();
                state.current_offset += total_bytes;
                total_bytes = 0;
                sink.sync()?;
                drop(state);
                self.more_data.notify_all();
                unflushed_bytes = 0;
            }
        }

        let mut state = self.state.lock().unwrap();
        state.current_offset += total_bytes;
        state.file_status = LocalFileStatus::Downloaded;
        sink.sync()?;
        // The status upgrade is the last on-disk change: data bytes are
        // durable before info.txt ever says Downloaded.
        LocalFileInfo::new(LocalFileStatus::Downloaded, self.metadata.class_name())
            .store(&self.local_path)?;
        let final_size = state.current_offset;
        drop(state);
        self.more_data.notify_all();

        if final_size != self.metadata.file_size() {
            warn!(
                path = %self.local_path.display(),
                expected = self.metadata.file_size(),
                actual = final_size,
                "source byte count disagrees with the descriptor"
            );
        }
        self.accounting.update_total_size(final_size as i64);
        trace!(
            path = %self.local_path.display(),
            metadata = %self.metadata.to_text(),
            "finished download into local cache"
        );
        Ok(())
    }

    /// Block until bytes `[start_offset, end_offset)` are published, the
    /// download completes, or the entry becomes invalid.
    pub fn wait_more_data(&self, start_offset: u64, end_offset: u64) -> WaitResult {
        // Readers are advised never to ask past the file end; clamp
        // defensively so an overshoot cannot wait forever.
        let end_offset = end_offset.min(self.metadata.file_size());

        let mut state = self.state.lock().unwrap();
        if state.file_status == LocalFileStatus::Downloaded {
            if start_offset >= state.current_offset {
                return WaitResult::EndOfFile;
            }
            return WaitResult::Ok;
        }
        if state.current_offset >= end_offset {
            return WaitResult::Ok;
        }

        state = self
            .more_data
            .wait_while(state, |s| {
                s.valid
                    && s.file_status != LocalFileStatus::Downloaded
                    && s.current_offset < end_offset
            })
            .unwrap();

        if !state.valid
            && state.file_status != LocalFileStatus::Downloaded
            && state.current_offset < end_offset
        {
            // The download died underneath us; the published prefix is the
            // reader's last consistent view.
            return WaitResult::EndOfFile;
        }
        WaitResult::Ok
    }

    /// [`Self::wait_more_data`] with a deadline. Returns
    /// [`WaitResult::Timeout`] without mutating state when the range is
    /// still unpublished after `timeout`.
    pub fn wait_more_data_timeout(
        &self,
        start_offset: u64,
        end_offset: u64,
        timeout: Duration,
    ) -> WaitResult {
        let end_offset = end_offset.min(self.metadata.file_size());

        let mut state = self.state.lock().unwrap();
        if state.file_status == LocalFileStatus::Downloaded {
            if start_offset >= state.current_offset {
                return WaitResult::EndOfFile;
            }
            return WaitResult::Ok;
        }
        if state.current_offset >= end_offset {
            return WaitResult::Ok;
        }

        let (state, wait_result) = self
            .more_data
            .wait_timeout_while(state, timeout, |s| {
                s.valid
                    && s.file_status != LocalFileStatus::Downloaded
                    && s.current_offset < end_offset
            })
            .unwrap();

        if wait_result.timed_out()
            && state.valid
            && state.file_status != LocalFileStatus::Downloaded
            && state.current_offset < end_offset
        {
            return WaitResult::Timeout;
        }
        if !state.valid
            && state.file_status != LocalFileStatus::Downloaded
            && state.current_offset < end_offset
        {
            return WaitResult::EndOfFile;
        }
        WaitResult::Ok
    }

    /// Open an independent positioned reader on this entry's data file
    /// and record its identity.
    pub fn open_reader(self: &Arc<Self>) -> Result<ReaderHandle> {
        let file = File::open(self.local_path.join(DATA_FILE))?;
        let mut state = self.state.lock().unwrap();
        if !state.valid {
            return Err(StoreError::BadArguments(format!(
                "cache entry {} is no longer valid",
                self.local_path.display()
            )));
        }
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        state.open_readers.insert(id);
        Ok(ReaderHandle::new(id, file, Arc::downgrade(self)))
    }

    /// Release `handle`. Closing a reader this controller never issued is
    /// a programming error.
    pub fn close_reader(&self, mut handle: ReaderHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open_readers.remove(&handle.id()) {
            return Err(StoreError::BadArguments(format!(
                "reader {} does not belong to cache entry {} (remote path: {})",
                handle.id(),
                self.local_path.display(),
                self.metadata.remote_path()
            )));
        }
        handle.mark_closed();
        drop(state);
        self.more_data.notify_all();
        Ok(())
    }

    /// Reader-drop path; absent identities are ignored here.
    pub(crate) fn release_reader(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.open_readers.remove(&id);
        drop(state);
        self.more_data.notify_all();
    }

    /// Number of reader handles currently outstanding.
    pub fn open_reader_count(&self) -> usize {
        self.state.lock().unwrap().open_readers.len()
    }

    /// Invalidate the entry, stop the download, wait for readers to
    /// drain, then delete the entry directory.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.valid = false;
        }
        self.more_data.notify_all();
        self.deactivate_download();

        let mut state = self.state.lock().unwrap();
        while !state.open_readers.is_empty() {
            state = self.more_data.wait(state).unwrap();
        }
        drop(state);

        trace!(path = %self.local_path.display(), "removing the local cache entry");
        fs::remove_dir_all(&self.local_path)?;
        Ok(())
    }

    fn deactivate_download(&self) {
        // Release the holder lock before joining: the finishing task
        // takes the same lock to drop its own handle.
        let task = self.download_task.lock().unwrap().take();
        if let Some(task) = task {
            task.deactivate();
        }
    }
}

impl Drop for CacheController {
    fn drop(&mut self) {
        // The download task must not outlive the controller, even when
        // the file never reached Downloaded.
        self.deactivate_download();
    }
}

impl std::fmt::Debug for CacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CacheController")
            .field("remote_path", &self.metadata.remote_path())
            .field("local_path", &self.local_path)
            .field("file_status", &state.file_status)
            .field("current_offset", &state.current_offset)
            .field("open_readers", &state.open_readers.len())
            .field("valid", &state.valid)
            .finish()
    }
}
