//! Integration tests for the per-symbol series engine.
//!
//! These cover the full pipeline: enqueue → background commit → index →
//! query, plus persistence across reopen and single-process locking.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tickdb::{Series, SeriesConfig, Tick, TickError};

// ============================================================================
// End-to-End Scenarios
// ============================================================================

#[test]
fn test_append_query_single() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    series.append(1000, 150.25, 100).unwrap();
    series.sync().unwrap();

    let hits = series.query_range(1000, 1000).unwrap();
    assert_eq!(hits, vec![Tick::new(1000, 150.25, 100)]);
    assert_eq!(series.count().unwrap(), 1);
}

#[test]
fn test_batch_and_tail() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    let ticks: Vec<Tick> = (1..=5)
        .map(|i| Tick::new(i, i as f64 * 10.0, i))
        .collect();
    series.append_batch(&ticks).unwrap();
    series.sync().unwrap();

    let tail = series.query_last(3).unwrap();
    assert_eq!(
        tail,
        vec![
            Tick::new(3, 30.0, 3),
            Tick::new(4, 40.0, 4),
            Tick::new(5, 50.0, 5),
        ]
    );
}

#[test]
fn test_range_selectivity() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    for ts in 1..=10u64 {
        series.append(ts, ts as f64, ts).unwrap();
    }
    series.sync().unwrap();

    let hits = series.query_range(3, 7).unwrap();
    assert_eq!(hits.len(), 5);
    let timestamps: Vec<u64> = hits.iter().map(|t| t.timestamp).collect();
    assert_eq!(timestamps, vec![3, 4, 5, 6, 7]);
}

#[test]
fn test_duplicate_timestamps_preserved() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    series.append(5, 1.0, 1).unwrap();
    series.append(5, 2.0, 2).unwrap();
    series.append(5, 3.0, 3).unwrap();
    series.sync().unwrap();

    let hits = series.query_range(5, 5).unwrap();
    assert_eq!(hits.len(), 3);
    let prices: Vec<f64> = hits.iter().map(|t| t.price).collect();
    assert_eq!(prices, vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_persistence_across_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let series = Series::open(dir.path(), "AAA").unwrap();
        let ticks: Vec<Tick> = (1..=1000)
            .map(|i| Tick::new(i, i as f64 * 0.5, i * 2))
            .collect();
        series.append_batch(&ticks).unwrap();
        series.sync().unwrap();
    }

    let series = Series::open(dir.path(), "AAA").unwrap();
    assert_eq!(series.count().unwrap(), 1000);

    let hits = series.query_range(500, 500).unwrap();
    assert_eq!(hits, vec![Tick::new(500, 250.0, 1000)]);
}

#[test]
fn test_growth_correctness_100k() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    // Well past the initial 4 KiB allocation, forcing several remaps.
    let ticks: Vec<Tick> = (1..=100_000)
        .map(|i| Tick::new(i, i as f64, i))
        .collect();
    series.append_batch(&ticks).unwrap();
    series.sync().unwrap();

    assert_eq!(series.count().unwrap(), 100_000);
    let hits = series.query_range(1, 100_000).unwrap();
    assert_eq!(hits.len(), 100_000);
    assert!(hits.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

// ============================================================================
// Boundary Cases
// ============================================================================

#[test]
fn test_empty_series_queries() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    assert_eq!(series.count().unwrap(), 0);
    assert!(series.query_range(0, u64::MAX).unwrap().is_empty());
    assert!(series.query_last(10).unwrap().is_empty());
}

#[test]
fn test_inverted_range_is_empty() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    series.append(5, 1.0, 1).unwrap();
    series.sync().unwrap();

    assert!(series.query_range(10, 1).unwrap().is_empty());
}

#[test]
fn test_query_last_boundaries() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    for ts in 1..=5u64 {
        series.append(ts, ts as f64, ts).unwrap();
    }
    series.sync().unwrap();

    assert!(series.query_last(0).unwrap().is_empty());
    // n beyond the row count returns everything, oldest first.
    let all = series.query_last(100).unwrap();
    assert_eq!(all.len(), 5);
    assert_eq!(all[0].timestamp, 1);
    assert_eq!(all[4].timestamp, 5);
}

#[test]
fn test_round_trip_after_sync() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    series.append(77, 1.25, 9).unwrap();
    series.sync().unwrap();

    let hits = series.query_range(77, 77).unwrap();
    assert!(hits.contains(&Tick::new(77, 1.25, 9)));
}

#[test]
fn test_reopen_is_idempotent() {
    let dir = TempDir::new().unwrap();

    let (count_before, rows_before) = {
        let series = Series::open(dir.path(), "AAA").unwrap();
        for ts in [3u64, 1, 4, 1, 5, 9, 2, 6] {
            series.append(ts, ts as f64, ts).unwrap();
        }
        series.sync().unwrap();
        (
            series.count().unwrap(),
            series.query_range(0, u64::MAX).unwrap(),
        )
    };

    let series = Series::open(dir.path(), "AAA").unwrap();
    assert_eq!(series.count().unwrap(), count_before);
    assert_eq!(series.query_range(0, u64::MAX).unwrap(), rows_before);
}

#[test]
fn test_drop_drains_queue() {
    let dir = TempDir::new().unwrap();

    {
        let series = Series::open(dir.path(), "AAA").unwrap();
        let ticks: Vec<Tick> = (1..=5000).map(|i| Tick::new(i, i as f64, i)).collect();
        series.append_batch(&ticks).unwrap();
        // No sync: drop must still commit everything before joining.
    }

    let series = Series::open(dir.path(), "AAA").unwrap();
    assert_eq!(series.count().unwrap(), 5000);
}

// ============================================================================
// Locking and Isolation
// ============================================================================

#[test]
fn test_second_open_fails_while_locked() {
    let dir = TempDir::new().unwrap();
    let _series = Series::open(dir.path(), "AAA").unwrap();

    let err = Series::open(dir.path(), "AAA").unwrap_err();
    assert!(matches!(err, TickError::SymbolLocked { .. }));
}

#[test]
fn test_lock_released_on_drop() {
    let dir = TempDir::new().unwrap();
    {
        let _series = Series::open(dir.path(), "AAA").unwrap();
    }
    // Same process, new handle: the advisory lock must be free again.
    let _series = Series::open(dir.path(), "AAA").unwrap();
}

#[test]
fn test_symbols_are_independent() {
    let dir = TempDir::new().unwrap();
    let aaa = Series::open(dir.path(), "AAA").unwrap();
    let bbb = Series::open(dir.path(), "BBB").unwrap();

    aaa.append(1, 1.0, 1).unwrap();
    bbb.append(2, 2.0, 2).unwrap();
    aaa.sync().unwrap();
    bbb.sync().unwrap();

    assert_eq!(aaa.count().unwrap(), 1);
    assert_eq!(bbb.count().unwrap(), 1);
    assert!(aaa.query_range(2, 2).unwrap().is_empty());
    assert!(bbb.query_range(1, 1).unwrap().is_empty());
}

// ============================================================================
// Corruption and Poisoning
// ============================================================================

#[test]
fn test_open_rejects_corrupt_column() {
    let dir = TempDir::new().unwrap();

    {
        let series = Series::open(dir.path(), "AAA").unwrap();
        series.append(1, 1.0, 1).unwrap();
        series.sync().unwrap();
    }

    // Truncate the timestamp column below its 8-byte header.
    let path = dir.path().join("AAA").join("timestamps.bin");
    std::fs::write(&path, [0u8; 4]).unwrap();

    let err = Series::open(dir.path(), "AAA").unwrap_err();
    assert!(matches!(err, TickError::CorruptHeader { .. }));
}

#[test]
fn test_commit_failure_poisons_series() {
    let dir = TempDir::new().unwrap();
    let series = Series::open(dir.path(), "AAA").unwrap();

    // A healthy commit first, so the failure provably flips state.
    series.append(1, 1.0, 1).unwrap();
    series.sync().unwrap();
    assert_eq!(series.count().unwrap(), 1);

    series.inject_commit_failure();
    series.append(2, 2.0, 2).unwrap();

    // The failed commit wakes the drain with the poisoned status.
    let err = series.sync().unwrap_err();
    assert!(matches!(err, TickError::SeriesPoisoned));

    // Every subsequent operation reports the same terminal state.
    assert!(matches!(
        series.append(3, 3.0, 3),
        Err(TickError::SeriesPoisoned)
    ));
    assert!(matches!(
        series.append_batch(&[Tick::new(4, 4.0, 4)]),
        Err(TickError::SeriesPoisoned)
    ));
    assert!(matches!(
        series.query_range(0, u64::MAX),
        Err(TickError::SeriesPoisoned)
    ));
    assert!(matches!(
        series.query_last(1),
        Err(TickError::SeriesPoisoned)
    ));
    assert!(matches!(series.count(), Err(TickError::SeriesPoisoned)));
    assert!(matches!(series.sync(), Err(TickError::SeriesPoisoned)));
}

#[test]
fn test_blocked_sync_woken_by_poison() {
    let dir = TempDir::new().unwrap();
    // One tick per commit keeps the writer busy long enough for the sync
    // below to park on the backlog before the failure is injected.
    let config = SeriesConfig::default().with_batch_size(1);
    let series = Arc::new(Series::open_with_config(dir.path(), "AAA", config).unwrap());

    // A backlog of 200k one-tick commits takes far longer to drain than
    // the injection delay below, so the failure lands mid-stream.
    let ticks: Vec<Tick> = (1..=200_000).map(|i| Tick::new(i, i as f64, i)).collect();
    series.append_batch(&ticks).unwrap();

    let waiter = {
        let series = Arc::clone(&series);
        thread::spawn(move || series.sync())
    };

    // Bias the interleaving toward "sync already blocked", then fail a
    // mid-stream commit. Either way the waiter must observe the poison.
    thread::sleep(Duration::from_millis(50));
    series.inject_commit_failure();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(TickError::SeriesPoisoned)));
    assert!(matches!(
        series.append(0, 0.0, 0),
        Err(TickError::SeriesPoisoned)
    ));
}

// ============================================================================
// On-Disk Layout
// ============================================================================

#[test]
fn test_on_disk_layout() {
    let dir = TempDir::new().unwrap();

    {
        let series = Series::open(dir.path(), "AAA").unwrap();
        series.append(7, 2.5, 40).unwrap();
        series.sync().unwrap();
    }

    let symbol_dir = dir.path().join("AAA");
    for name in ["timestamps.bin", "prices.bin", "volumes.bin"] {
        let meta = std::fs::metadata(symbol_dir.join(name)).unwrap();
        // 8-byte header plus a whole number of 8-byte records.
        assert!(meta.len() >= 16);
        assert_eq!((meta.len() - 8) % 8, 0);
    }

    // First record of the timestamp column follows the count header.
    let bytes = std::fs::read(symbol_dir.join("timestamps.bin")).unwrap();
    let count = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let first = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    assert_eq!(count, 1);
    assert_eq!(first, 7);

    // Prices are IEEE-754 little-endian.
    let bytes = std::fs::read(symbol_dir.join("prices.bin")).unwrap();
    let price = f64::from_le_bytes(bytes[8..16].try_into().unwrap());
    assert!((price - 2.5).abs() < f64::EPSILON);
}
