//! Per-symbol tick series: three columns, a timestamp index, and a
//! background writer.
//!
//! # Architecture
//!
//! ```text
//! producer ─► write queue ─► writer thread ─► columns + index
//!                                 │
//! reader ──► shared lock ─────────┴─► exclusive lock per batch
//! ```
//!
//! Producers enqueue ticks and return immediately. The writer drains the
//! queue in batches and commits each batch under the exclusive lock:
//! appends to all three columns, header flushes, then index inserts.
//! Readers under the shared lock therefore never observe a row that is
//! present in one column but missing from another, nor an index entry
//! whose row is not yet materialized.
//!
//! # Example
//!
//! ```rust,ignore
//! use tickdb::Series;
//!
//! let series = Series::open("/var/lib/tickdb", "AAPL")?;
//! series.append(1_700_000_000, 189.25, 300)?;
//! series.sync()?;
//! let ticks = series.query_range(1_700_000_000, 1_700_000_060)?;
//! ```

mod writer;

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::column::Column;
use crate::error::{Result, TickError};
use crate::index::TimeIndex;

/// File name of the timestamp column inside a symbol directory.
pub const TIMESTAMPS_FILE: &str = "timestamps.bin";

/// File name of the price column inside a symbol directory.
pub const PRICES_FILE: &str = "prices.bin";

/// File name of the volume column inside a symbol directory.
pub const VOLUMES_FILE: &str = "volumes.bin";

/// File name of the advisory lock inside a symbol directory.
pub const LOCK_FILE: &str = "LOCK";

/// Record size shared by all three columns (u64 / f64 / u64).
const ELEMENT_SIZE: u64 = 8;

/// Default maximum number of ticks committed per writer batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// One trade record: timestamp, price, volume.
///
/// Timestamps are opaque to the store; equal timestamps are permitted and
/// preserved in insertion order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    /// Event timestamp (caller-defined unit, typically epoch nanoseconds).
    pub timestamp: u64,
    /// Trade price.
    pub price: f64,
    /// Trade volume.
    pub volume: u64,
}

impl Tick {
    /// Creates a new tick.
    pub fn new(timestamp: u64, price: f64, volume: u64) -> Self {
        Self {
            timestamp,
            price,
            volume,
        }
    }
}

/// Durability behavior of [`Series::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// `sync` drains the writer; column flushes stay asynchronous hints
    /// (default, matches the on-disk format's original semantics).
    #[default]
    Async,
    /// `sync` additionally msyncs all three columns, making it a physical
    /// durability boundary.
    Sync,
}

/// Configuration for a [`Series`].
#[derive(Debug, Clone)]
pub struct SeriesConfig {
    /// Maximum ticks per writer batch.
    pub batch_size: usize,
    /// Durability behavior of `sync`.
    pub flush_mode: FlushMode,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_mode: FlushMode::default(),
        }
    }
}

impl SeriesConfig {
    /// Sets the maximum ticks per writer batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the durability behavior of `sync`.
    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }
}

/// The three columns plus the index, guarded together by the series lock.
#[derive(Debug)]
pub(crate) struct TickStore {
    pub(crate) timestamps: Column,
    pub(crate) prices: Column,
    pub(crate) volumes: Column,
    pub(crate) index: TimeIndex,
}

impl TickStore {
    /// Opens the three column files and rebuilds the index from the
    /// timestamp column.
    fn open(dir: &Path) -> Result<Self> {
        let timestamps = Column::open(dir.join(TIMESTAMPS_FILE), ELEMENT_SIZE)?;
        let prices = Column::open(dir.join(PRICES_FILE), ELEMENT_SIZE)?;
        let volumes = Column::open(dir.join(VOLUMES_FILE), ELEMENT_SIZE)?;

        let mut store = Self {
            timestamps,
            prices,
            volumes,
            index: TimeIndex::new(),
        };

        let count = store.logical_count();
        for row in 0..count {
            let ts = store.read_u64(Field::Timestamp, row)?;
            store.index.insert(ts, row);
        }
        debug!(rows = count, "rebuilt timestamp index");

        Ok(store)
    }

    /// Returns the logical row count: the minimum of the three column
    /// counts, with a diagnostic when they disagree.
    pub(crate) fn logical_count(&self) -> u64 {
        let (t, p, v) = (
            self.timestamps.count(),
            self.prices.count(),
            self.volumes.count(),
        );
        if t != p || p != v {
            warn!(
                timestamps = t,
                prices = p,
                volumes = v,
                "column counts disagree; using the minimum"
            );
        }
        t.min(p).min(v)
    }

    /// Commits a batch: appends all three columns, flushes headers, then
    /// inserts index entries for the new rows.
    pub(crate) fn commit(&mut self, batch: &[Tick]) -> Result<()> {
        let start = self.timestamps.count();

        let mut ts_buf = Vec::with_capacity(batch.len() * ELEMENT_SIZE as usize);
        let mut price_buf = Vec::with_capacity(batch.len() * ELEMENT_SIZE as usize);
        let mut volume_buf = Vec::with_capacity(batch.len() * ELEMENT_SIZE as usize);
        for tick in batch {
            ts_buf.extend_from_slice(&tick.timestamp.to_le_bytes());
            price_buf.extend_from_slice(&tick.price.to_le_bytes());
            volume_buf.extend_from_slice(&tick.volume.to_le_bytes());
        }

        self.timestamps.append_batch(&ts_buf)?;
        self.prices.append_batch(&price_buf)?;
        self.volumes.append_batch(&volume_buf)?;

        self.timestamps.flush_header()?;
        self.prices.flush_header()?;
        self.volumes.flush_header()?;

        for (i, tick) in batch.iter().enumerate() {
            self.index.insert(tick.timestamp, start + i as u64);
        }

        Ok(())
    }

    /// Reads the full row at `row`.
    pub(crate) fn row(&self, row: u64) -> Result<Tick> {
        Ok(Tick {
            timestamp: self.read_u64(Field::Timestamp, row)?,
            price: f64::from_bits(self.read_u64(Field::Price, row)?),
            volume: self.read_u64(Field::Volume, row)?,
        })
    }

    fn read_u64(&self, field: Field, row: u64) -> Result<u64> {
        let column = match field {
            Field::Timestamp => &self.timestamps,
            Field::Price => &self.prices,
            Field::Volume => &self.volumes,
        };
        let bytes = column.read(row)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Synchronously flushes all three columns.
    fn flush_all(&mut self) -> Result<()> {
        self.timestamps.flush()?;
        self.prices.flush()?;
        self.volumes.flush()?;
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Field {
    Timestamp,
    Price,
    Volume,
}

/// Pending ticks plus the stop signal, guarded by the queue mutex.
#[derive(Debug)]
pub(crate) struct WriteQueue {
    pub(crate) ticks: VecDeque<Tick>,
    pub(crate) stop: bool,
}

/// State shared between the series handle and its writer thread.
#[derive(Debug)]
pub(crate) struct Shared {
    /// Columns and index; shared for queries, exclusive for commits.
    pub(crate) store: RwLock<TickStore>,
    /// Producer/consumer queue.
    pub(crate) queue: Mutex<WriteQueue>,
    /// Signals the writer that the queue is non-empty or stop is set.
    pub(crate) queue_cv: Condvar,
    /// Ticks enqueued but not yet committed.
    pub(crate) pending: Mutex<u64>,
    /// Signals `sync` waiters when pending reaches zero or the series is
    /// poisoned.
    pub(crate) drain_cv: Condvar,
    /// Set by the writer on a failed commit; terminal.
    pub(crate) poisoned: AtomicBool,
    /// Test hook: when set, the writer's next commit fails with an
    /// injected I/O error instead of touching the store.
    pub(crate) fail_next_commit: AtomicBool,
    /// Maximum ticks per writer batch.
    pub(crate) batch_size: usize,
}

/// A per-symbol tick store.
///
/// Owns three append-only columns (`timestamps.bin`, `prices.bin`,
/// `volumes.bin`), an in-memory timestamp index, and one background writer
/// thread. Dropping the series stops the writer after draining all queued
/// ticks, then flushes and unmaps the columns.
#[derive(Debug)]
pub struct Series {
    shared: Arc<Shared>,
    writer: Option<JoinHandle<()>>,
    flush_mode: FlushMode,
    dir: PathBuf,
    lock_file: File,
}

impl Series {
    /// Opens the series for `symbol` under `data_dir` with the default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::SymbolLocked`] if another process holds the
    /// symbol directory, [`TickError::CorruptHeader`] if a column file
    /// fails validation, and [`TickError::IoError`] for other filesystem
    /// failures.
    pub fn open(data_dir: impl AsRef<Path>, symbol: &str) -> Result<Self> {
        Self::open_with_config(data_dir, symbol, SeriesConfig::default())
    }

    /// Opens the series with an explicit configuration.
    ///
    /// Creates `data_dir/symbol/` if needed, takes the advisory lock,
    /// opens the columns, rebuilds the index from the timestamp column,
    /// and starts the writer thread.
    ///
    /// # Errors
    ///
    /// See [`Series::open`].
    pub fn open_with_config(
        data_dir: impl AsRef<Path>,
        symbol: &str,
        config: SeriesConfig,
    ) -> Result<Self> {
        let dir = data_dir.as_ref().join(symbol);
        std::fs::create_dir_all(&dir)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|err| {
            if err.kind() == io::ErrorKind::WouldBlock {
                TickError::SymbolLocked { path: dir.clone() }
            } else {
                TickError::IoError(err)
            }
        })?;

        let store = TickStore::open(&dir)?;

        let shared = Arc::new(Shared {
            store: RwLock::new(store),
            queue: Mutex::new(WriteQueue {
                ticks: VecDeque::new(),
                stop: false,
            }),
            queue_cv: Condvar::new(),
            pending: Mutex::new(0),
            drain_cv: Condvar::new(),
            poisoned: AtomicBool::new(false),
            fail_next_commit: AtomicBool::new(false),
            batch_size: config.batch_size,
        });

        let writer_shared = Arc::clone(&shared);
        let writer = std::thread::Builder::new()
            .name(format!("tickdb-writer-{symbol}"))
            .spawn(move || writer::run(writer_shared))?;

        debug!(symbol, dir = %dir.display(), "opened series");
        Ok(Self {
            shared,
            writer: Some(writer),
            flush_mode: config.flush_mode,
            dir,
            lock_file,
        })
    }

    /// Enqueues one tick for the background writer.
    ///
    /// Returns once the tick is queued; it is not yet visible to queries
    /// until the writer commits it. Use [`Series::sync`] to wait for the
    /// queue to drain.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::SeriesPoisoned`] after a writer failure.
    pub fn append(&self, timestamp: u64, price: f64, volume: u64) -> Result<()> {
        self.append_batch(&[Tick::new(timestamp, price, volume)])
    }

    /// Enqueues a batch of ticks atomically.
    ///
    /// The batch is placed on the queue under a single lock acquisition,
    /// so a single producer's ticks commit in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::SeriesPoisoned`] after a writer failure.
    pub fn append_batch(&self, ticks: &[Tick]) -> Result<()> {
        if ticks.is_empty() {
            return Ok(());
        }
        self.check_poisoned()?;

        // Pending rises before the ticks are visible to the writer, so a
        // racing `sync` cannot return between enqueue and commit.
        {
            let mut pending = lock(&self.shared.pending);
            *pending += ticks.len() as u64;
        }
        {
            let mut queue = lock(&self.shared.queue);
            queue.ticks.extend(ticks.iter().copied());
        }
        self.shared.queue_cv.notify_one();
        Ok(())
    }

    /// Returns all ticks with `lo <= timestamp <= hi`, ascending, ties in
    /// insertion order. An inverted range yields an empty vector.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::SeriesPoisoned`] after a writer failure.
    pub fn query_range(&self, lo: u64, hi: u64) -> Result<Vec<Tick>> {
        self.check_poisoned()?;
        let store = read_lock(&self.shared.store);

        let hits = store.index.range(lo, hi);
        let mut out = Vec::with_capacity(hits.len());
        for (ts, row) in hits {
            out.push(Tick {
                timestamp: ts,
                price: f64::from_bits(store.read_u64(Field::Price, row)?),
                volume: store.read_u64(Field::Volume, row)?,
            });
        }
        Ok(out)
    }

    /// Returns the last `min(n, count)` committed ticks in insertion
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::SeriesPoisoned`] after a writer failure.
    pub fn query_last(&self, n: u64) -> Result<Vec<Tick>> {
        self.check_poisoned()?;
        let store = read_lock(&self.shared.store);

        let count = store.logical_count();
        let start = count.saturating_sub(n);
        let mut out = Vec::with_capacity((count - start) as usize);
        for row in start..count {
            out.push(store.row(row)?);
        }
        Ok(out)
    }

    /// Returns the number of committed rows.
    ///
    /// Reported as the minimum of the three column counts; a disagreement
    /// (which the commit protocol prevents in normal operation) is logged
    /// as a warning.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::SeriesPoisoned`] after a writer failure.
    pub fn count(&self) -> Result<u64> {
        self.check_poisoned()?;
        Ok(read_lock(&self.shared.store).logical_count())
    }

    /// Blocks until every previously enqueued tick has been committed and
    /// indexed.
    ///
    /// With [`FlushMode::Sync`] the columns are additionally msynced, so a
    /// returned `sync` is a physical durability boundary. With the default
    /// [`FlushMode::Async`] it is a writer-drain barrier only.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::SeriesPoisoned`] if the writer failed, before
    /// or during the wait.
    pub fn sync(&self) -> Result<()> {
        {
            let mut pending = lock(&self.shared.pending);
            while *pending > 0 && !self.shared.poisoned.load(Ordering::Acquire) {
                pending = self
                    .shared
                    .drain_cv
                    .wait(pending)
                    .unwrap_or_else(|err| err.into_inner());
            }
        }
        self.check_poisoned()?;

        if self.flush_mode == FlushMode::Sync {
            write_lock(&self.shared.store).flush_all()?;
        }
        Ok(())
    }

    /// Returns the symbol directory this series owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Makes the writer's next commit fail with an injected I/O error,
    /// driving the series into the poisoned state. Test support only.
    #[doc(hidden)]
    pub fn inject_commit_failure(&self) {
        self.shared.fail_next_commit.store(true, Ordering::Release);
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.shared.poisoned.load(Ordering::Acquire) {
            return Err(TickError::SeriesPoisoned);
        }
        Ok(())
    }
}

impl Drop for Series {
    fn drop(&mut self) {
        {
            let mut queue = lock(&self.shared.queue);
            queue.stop = true;
        }
        self.shared.queue_cv.notify_all();

        if let Some(handle) = self.writer.take() {
            if handle.join().is_err() {
                warn!(dir = %self.dir.display(), "writer thread panicked during shutdown");
            }
        }

        let _ = FileExt::unlock(&self.lock_file);
    }
}

/// Locks a mutex, continuing through poisoning from a panicked peer.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// Acquires a shared store lock, continuing through poisoning.
pub(crate) fn read_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(|err| err.into_inner())
}

/// Acquires an exclusive store lock, continuing through poisoning.
pub(crate) fn write_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(|err| err.into_inner())
}
