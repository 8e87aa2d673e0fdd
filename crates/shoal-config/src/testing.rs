//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage an isolated cache root per test.
//! Tests never touch the global config or the user's home directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with a unique cache root
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated cache root directory
    pub cache_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let cache_root = temp_dir.path().join("cache");
        std::fs::create_dir_all(&cache_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            cache_root,
            test_id,
        })
    }

    /// Config pointing at this environment's cache root.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.cache_root = self.cache_root.clone();
        cfg
    }

    /// Path of the entry directory for `name` under the cache root.
    pub fn entry_dir(&self, name: &str) -> PathBuf {
        self.cache_root.join(name)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
