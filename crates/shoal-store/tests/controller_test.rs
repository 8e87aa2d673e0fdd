//! Download, wait, and reader-lifecycle scenarios for `CacheController`.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use shoal_config::testing::TestEnvironment;
use shoal_metadata::FileMetadata;
use shoal_store::{
    CacheAccounting, CacheController, LocalFileStatus, NullAccounting, StoreError, TaskPool,
    WaitResult,
};

/// Deterministic payload: 1,000 bytes `0x00..=0xE7` repeating.
fn test_payload() -> Vec<u8> {
    (0..1000u32).map(|i| (i % 256) as u8).collect()
}

/// Byte source whose visible prefix is opened in steps by the test.
struct GatedSource {
    data: Vec<u8>,
    pos: usize,
    gate: Arc<Gate>,
}

struct Gate {
    allowed: Mutex<usize>,
    opened: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            allowed: Mutex::new(0),
            opened: Condvar::new(),
        })
    }

    /// Allow the source to emit bytes up to `upto`.
    fn release(&self, upto: usize) {
        let mut allowed = self.allowed.lock().unwrap();
        *allowed = (*allowed).max(upto);
        drop(allowed);
        self.opened.notify_all();
    }
}

impl GatedSource {
    fn new(data: Vec<u8>, gate: Arc<Gate>) -> Self {
        Self { data, pos: 0, gate }
    }
}

impl Read for GatedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut allowed = self.gate.allowed.lock().unwrap();
        while *allowed <= self.pos && *allowed < self.data.len() {
            allowed = self.gate.opened.wait(allowed).unwrap();
        }
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        let limit = (*allowed).min(self.data.len());
        let n = (limit - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Endless source for cancellation tests; every read yields one byte.
struct TrickleSource;

impl Read for TrickleSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(Duration::from_millis(1));
        buf[0] = 0x55;
        Ok(1.min(buf.len()))
    }
}

struct FakeAccounting {
    total: AtomicU64,
}

impl FakeAccounting {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(0),
        })
    }
}

impl CacheAccounting for FakeAccounting {
    fn update_total_size(&self, delta: i64) {
        if delta >= 0 {
            self.total.fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            self.total.fetch_sub((-delta) as u64, Ordering::SeqCst);
        }
    }
}

/// Wait for the downloader to run its completion step. Publication can
/// race ahead of the status transition, so asserts on `Downloaded` state
/// poll instead of relying on `wait_more_data` alone.
fn wait_until_downloaded(controller: &CacheController) {
    for _ in 0..1000 {
        if controller.file_status() == LocalFileStatus::Downloaded {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("download did not complete in time");
}

fn fresh_controller(
    env: &TestEnvironment,
    name: &str,
    file_size: u64,
    flush_threshold: u64,
) -> Arc<CacheController> {
    let metadata = Arc::new(FileMetadata::new(
        format!("remote://{name}"),
        file_size,
        "v1",
    ));
    CacheController::new(
        metadata,
        env.entry_dir(name),
        flush_threshold,
        Arc::new(NullAccounting),
    )
    .unwrap()
}

#[test]
fn test_fresh_download_single_reader() {
    // S1: source yields 1,000 deterministic bytes, flush threshold 300.
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));
    let payload = test_payload();

    let controller = fresh_controller(&env, "s1", 1000, 300);
    let gate = Gate::new();
    gate.release(1000);
    let source = GatedSource::new(payload.clone(), Arc::clone(&gate));
    controller
        .start_background_download(Box::new(source), &pool)
        .unwrap();

    assert_eq!(controller.wait_more_data(0, 1000), WaitResult::Ok);

    let reader = controller.open_reader().unwrap();
    let mut read_back = vec![0u8; 1000];
    reader.read_exact_at(&mut read_back, 0).unwrap();
    assert_eq!(read_back, payload);
    controller.close_reader(reader).unwrap();

    wait_until_downloaded(&controller);
    assert_eq!(controller.file_status(), LocalFileStatus::Downloaded);
    assert_eq!(controller.current_offset(), 1000);

    // info.txt records completion with the integer status code.
    let info: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(env.entry_dir("s1").join("info.txt")).unwrap(),
    )
    .unwrap();
    assert_eq!(info["file_status"], 2);
    assert_eq!(info["metadata_class"], "file");
}

#[test]
fn test_early_read_unblocks_on_first_flush() {
    // S2: reader asks for a prefix while the source is paused at 400.
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));

    let controller = fresh_controller(&env, "s2", 1000, 300);
    let gate = Gate::new();
    let source = GatedSource::new(test_payload(), Arc::clone(&gate));
    controller
        .start_background_download(Box::new(source), &pool)
        .unwrap();

    gate.release(400);
    assert_eq!(controller.wait_more_data(0, 100), WaitResult::Ok);
    assert_eq!(controller.current_offset(), 400);
    assert_eq!(controller.file_status(), LocalFileStatus::Downloading);

    // A range past the published prefix blocks until more data arrives.
    assert_eq!(
        controller.wait_more_data_timeout(0, 500, Duration::from_millis(50)),
        WaitResult::Timeout
    );

    gate.release(1000);
    assert_eq!(controller.wait_more_data(0, 500), WaitResult::Ok);
    assert_eq!(controller.wait_more_data(0, 1000), WaitResult::Ok);
    wait_until_downloaded(&controller);
}

#[test]
fn test_end_of_file_signal() {
    // S3: a late reader past the end observes EndOfFile.
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));

    let controller = fresh_controller(&env, "s3", 1000, 300);
    let gate = Gate::new();
    gate.release(1000);
    let source = GatedSource::new(test_payload(), Arc::clone(&gate));
    controller
        .start_background_download(Box::new(source), &pool)
        .unwrap();

    assert_eq!(controller.wait_more_data(0, 1000), WaitResult::Ok);
    wait_until_downloaded(&controller);
    assert_eq!(controller.wait_more_data(1000, 1001), WaitResult::EndOfFile);
}

#[test]
fn test_staleness_is_version_inequality() {
    // S6: staleness compares version tokens only.
    let env = TestEnvironment::new().unwrap();
    let controller = fresh_controller(&env, "s6", 1000, 300);

    let same = FileMetadata::new("remote://s6", 1000, "v1");
    let newer = FileMetadata::new("remote://s6", 1000, "v2");
    assert!(!controller.is_stale(&same));
    assert!(controller.is_stale(&newer));
}

#[test]
fn test_offset_is_monotonic_and_published_in_batches() {
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));

    let controller = fresh_controller(&env, "monotonic", 1000, 250);
    let gate = Gate::new();
    let source = GatedSource::new(test_payload(), Arc::clone(&gate));
    controller
        .start_background_download(Box::new(source), &pool)
        .unwrap();

    // Nothing may be visible below the flush threshold.
    gate.release(100);
    assert_eq!(
        controller.wait_more_data_timeout(0, 100, Duration::from_millis(50)),
        WaitResult::Timeout
    );
    assert_eq!(controller.current_offset(), 0);

    let mut last = 0;
    for step in [300usize, 600, 850, 1000] {
        gate.release(step);
        let wait_to = step.min(1000) as u64;
        assert_eq!(controller.wait_more_data(0, wait_to), WaitResult::Ok);
        let offset = controller.current_offset();
        assert!(offset >= last, "offset went backwards: {last} -> {offset}");
        last = offset;
    }
    assert_eq!(controller.current_offset(), 1000);
}

#[test]
fn test_concurrent_readers_observe_published_prefix() {
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));
    let payload = test_payload();

    let controller = fresh_controller(&env, "concurrent", 1000, 200);
    let gate = Gate::new();
    let source = GatedSource::new(payload.clone(), Arc::clone(&gate));
    controller
        .start_background_download(Box::new(source), &pool)
        .unwrap();

    let mut joins = Vec::new();
    for i in 0..4u64 {
        let controller = Arc::clone(&controller);
        let payload = payload.clone();
        joins.push(thread::spawn(move || {
            let (start, end) = (i * 200, i * 200 + 200);
            assert_eq!(controller.wait_more_data(start, end), WaitResult::Ok);
            let reader = controller.open_reader().unwrap();
            let mut buf = vec![0u8; (end - start) as usize];
            reader.read_exact_at(&mut buf, start).unwrap();
            assert_eq!(buf, &payload[start as usize..end as usize]);
            controller.close_reader(reader).unwrap();
        }));
    }

    for step in [250usize, 500, 750, 1000] {
        thread::sleep(Duration::from_millis(5));
        gate.release(step);
    }
    for join in joins {
        join.join().unwrap();
    }
    assert_eq!(controller.open_reader_count(), 0);
}

#[test]
fn test_close_cancels_download_and_removes_directory() {
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));

    let controller = fresh_controller(&env, "cancel", u64::MAX, 64);
    controller
        .start_background_download(Box::new(TrickleSource), &pool)
        .unwrap();

    // Let a few batches land, then tear the entry down mid-download.
    assert_eq!(controller.wait_more_data(0, 64), WaitResult::Ok);
    controller.close().unwrap();

    assert!(!controller.is_valid());
    assert!(!env.entry_dir("cancel").exists());
    assert_ne!(controller.file_status(), LocalFileStatus::Downloaded);
}

#[test]
fn test_close_waits_for_reader_drain() {
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));

    let controller = fresh_controller(&env, "drain", 1000, 300);
    let gate = Gate::new();
    gate.release(1000);
    let source = GatedSource::new(test_payload(), Arc::clone(&gate));
    controller
        .start_background_download(Box::new(source), &pool)
        .unwrap();
    assert_eq!(controller.wait_more_data(0, 1000), WaitResult::Ok);

    let reader = controller.open_reader().unwrap();
    assert_eq!(controller.open_reader_count(), 1);

    let closer = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            controller.close_reader(reader).unwrap();
        })
    };

    controller.close().unwrap();
    closer.join().unwrap();

    assert_eq!(controller.open_reader_count(), 0);
    assert!(!env.entry_dir("drain").exists());
}

#[test]
fn test_invalid_entry_refuses_new_readers() {
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));

    let controller = fresh_controller(&env, "invalid", 1000, 300);
    let gate = Gate::new();
    gate.release(1000);
    let source = GatedSource::new(test_payload(), Arc::clone(&gate));
    controller
        .start_background_download(Box::new(source), &pool)
        .unwrap();
    assert_eq!(controller.wait_more_data(0, 1000), WaitResult::Ok);

    controller.close().unwrap();
    assert!(matches!(
        controller.open_reader(),
        Err(StoreError::BadArguments(_)) | Err(StoreError::Io(_))
    ));
}

#[test]
fn test_closing_foreign_reader_is_bad_arguments() {
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));

    let a = fresh_controller(&env, "owner-a", 10, 4);
    let b = fresh_controller(&env, "owner-b", 10, 4);
    for controller in [&a, &b] {
        let gate = Gate::new();
        gate.release(10);
        let source = GatedSource::new(vec![0xAB; 10], Arc::clone(&gate));
        controller
            .start_background_download(Box::new(source), &pool)
            .unwrap();
        assert_eq!(controller.wait_more_data(0, 10), WaitResult::Ok);
    }

    let reader_from_a = a.open_reader().unwrap();
    let err = b.close_reader(reader_from_a).unwrap_err();
    assert!(matches!(err, StoreError::BadArguments(_)));
}

#[test]
fn test_starting_twice_is_bad_arguments() {
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));

    let controller = fresh_controller(&env, "twice", 1000, 300);
    let gate = Gate::new();
    gate.release(1000);
    controller
        .start_background_download(
            Box::new(GatedSource::new(test_payload(), Arc::clone(&gate))),
            &pool,
        )
        .unwrap();
    assert_eq!(controller.wait_more_data(0, 1000), WaitResult::Ok);

    let second = controller.start_background_download(Box::new(TrickleSource), &pool);
    assert!(matches!(second, Err(StoreError::BadArguments(_))));
}

#[test]
fn test_failed_download_marks_entry_invalid_and_wakes_waiters() {
    struct FailingSource {
        remaining: usize,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "link down"));
            }
            let n = self.remaining.min(buf.len());
            buf[..n].fill(0x11);
            self.remaining -= n;
            Ok(n)
        }
    }

    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));

    let controller = fresh_controller(&env, "failing", 1000, 100);
    controller
        .start_background_download(Box::new(FailingSource { remaining: 400 }), &pool)
        .unwrap();

    // The waiter is woken by the failure broadcast, not left hanging.
    let result = controller.wait_more_data(0, 1000);
    assert_eq!(result, WaitResult::EndOfFile);
    assert!(!controller.is_valid());
    assert_eq!(controller.current_offset(), 400);
}

#[test]
fn test_completion_reports_final_size_to_accounting() {
    let env = TestEnvironment::new().unwrap();
    let pool = TaskPool::new("test", Some(2));
    let accounting = FakeAccounting::new();

    let metadata = Arc::new(FileMetadata::new("remote://accounted", 1000, "v1"));
    let controller = CacheController::new(
        metadata,
        env.entry_dir("accounted"),
        300,
        Arc::clone(&accounting) as Arc<dyn CacheAccounting>,
    )
    .unwrap();

    let gate = Gate::new();
    gate.release(1000);
    controller
        .start_background_download(
            Box::new(GatedSource::new(test_payload(), Arc::clone(&gate))),
            &pool,
        )
        .unwrap();
    assert_eq!(controller.wait_more_data(0, 1000), WaitResult::Ok);
    wait_until_downloaded(&controller);

    // The final size is reported after the status flips, so poll.
    for _ in 0..1000 {
        if accounting.total.load(Ordering::SeqCst) == 1000 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(accounting.total.load(Ordering::SeqCst), 1000);
}
