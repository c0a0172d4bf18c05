use std::backtrace::Backtrace;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fs, thread};
use tempfile::TempDir;
use tilecache::{
    CacheConfig, CacheError, CacheResult, DiskStorage, FileCache, RecordStoreCache,
    StorageRecordStore, TileBuffer, TileCacheProvider, TileKey, TileMapType, TileParams,
    UniformLayerFormat,
};

/// Largest record the disk record store accepts.
pub const RECORD_STORE_PAGE_SIZE: u32 = 64 * 1024;

/// Runs a test with retry logic and error handling.
/// Tests run on the current thread to avoid thread exhaustion when running many tests in parallel.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> CacheResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> CacheResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> CacheResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error: Option<String> = None;
    let mut last_backtrace: Option<String> = None;

    for attempt in 1..=MAX_RETRIES {
        let start_time = Instant::now();

        let result = std::panic::catch_unwind(|| {
            let backtrace = Backtrace::capture();
            match before() {
                Ok(ctx) => match test(ctx.clone()) {
                    Ok(_) => match after(ctx) {
                        Ok(_) => Ok(()),
                        Err(e) => Err((
                            format!("After run failed: {:?}", e),
                            backtrace.to_string(),
                        )),
                    },
                    Err(e) => {
                        let _ = after(ctx);
                        Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                    }
                },
                Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
            }
        });

        let elapsed = start_time.elapsed();

        match result {
            Ok(Ok(_)) => return,
            Ok(Err((e, bt))) => {
                last_error = Some(e.clone());
                last_backtrace = Some(bt);
                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Failed (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Error: {}", e);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
            Err(panic_err) => {
                let err_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                last_error = Some(format!("Panic: {}", err_msg));

                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Panicked (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Panic: {}", err_msg);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
        }
    }

    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {} attempts", MAX_RETRIES);
    eprintln!("Last error: {}", last_error.as_deref().unwrap_or("Unknown"));
    if let Some(bt) = &last_backtrace {
        if !bt.is_empty() && !bt.contains("disabled") {
            eprintln!("\nBacktrace:\n{}", bt);
        }
    }
    eprintln!("=====================================================\n");

    panic!(
        "Test failed after {} attempts. Last error: {}",
        MAX_RETRIES,
        last_error.unwrap_or_default()
    );
}

/// A scratch cache directory plus the configuration the test runs with.
///
/// Every call to [`TestContext::file_cache`] creates a fresh instance over
/// the same directory, which is how reopen scenarios are written.
#[derive(Clone)]
pub struct TestContext {
    dir: Arc<TempDir>,
    config: CacheConfig,
}

impl TestContext {
    pub fn new(dir: TempDir, config: CacheConfig) -> Self {
        Self {
            dir: Arc::new(dir),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Opens a new file cache instance on the context directory.
    pub fn file_cache(&self) -> CacheResult<FileCache> {
        self.file_cache_with(self.config.clone())
    }

    pub fn file_cache_with(&self, config: CacheConfig) -> CacheResult<FileCache> {
        let cache = FileCache::on_disk(self.path(), Arc::new(UniformLayerFormat::new(1)), config)?;
        if !cache.open() {
            return Err(CacheError::InvalidOperation("file cache failed to open".into()));
        }
        Ok(cache)
    }

    /// Opens a new record-store cache instance; its records live in a
    /// `records` sub-directory.
    pub fn record_store_cache(&self) -> CacheResult<RecordStoreCache> {
        let storage = DiskStorage::open(self.path().join("records"))?;
        let store = StorageRecordStore::new(Arc::new(storage), RECORD_STORE_PAGE_SIZE);
        let cache = RecordStoreCache::new(Arc::new(store), self.config.clone());
        if !cache.open() {
            return Err(CacheError::InvalidOperation(
                "record store cache failed to open".into(),
            ));
        }
        Ok(cache)
    }
}

fn create_context(config: CacheConfig) -> CacheResult<TestContext> {
    let dir = tempfile::Builder::new().prefix("tilecache_").tempdir()?;
    Ok(TestContext::new(dir, config))
}

/// A context using the default configuration.
pub fn create_test_context() -> CacheResult<TestContext> {
    create_context(CacheConfig::default())
}

/// A context with 4 KiB pages so a handful of writes rotates the ring.
pub fn create_small_page_context() -> CacheResult<TestContext> {
    create_context(CacheConfig::default().max_page_size(4096))
}

pub fn cleanup(ctx: TestContext) -> CacheResult<()> {
    let path = ctx.path().to_path_buf();
    for retry in 0..5u64 {
        match fs::remove_dir_all(&path) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) if retry < 4 => {
                log::debug!("Retrying removal of {:?}: {}", path, e);
                thread::sleep(Duration::from_millis(50 * (retry + 1)));
            }
            Err(e) => {
                eprintln!("Warning: Failed to remove test directory {:?}: {:?}", path, e);
            }
        }
    }
    Ok(())
}

/// A spatial tile at `(lat, lon)`. Contexts use a layer format with unit
/// tile size, so the grid index is the coordinate.
pub fn tile(lat: i32, lon: i32) -> TileKey {
    TileKey::spatial(TileParams::new(0, 0, lat, lon))
}

pub fn buffer(key: &TileKey, importance: u8, data: Vec<u8>) -> TileBuffer {
    TileBuffer::new(key.with_importance(importance, TileMapType::Map), data)
}

pub fn at_importance(key: &TileKey, importance: u8) -> TileKey {
    key.with_importance(importance, TileMapType::Map)
}

/// Deterministic payload that differs per `seed`.
pub fn payload(seed: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (seed.wrapping_mul(31).wrapping_add(i as u32) % 251) as u8)
        .collect()
}
