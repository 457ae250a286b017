//! tickdb - Embeddable Columnar Tick Store
//!
//! This crate provides a single-process store for financial tick data
//! (timestamp, price, volume), organized per symbol.
//!
//! # Components
//!
//! - [`Column`]: Memory-mapped append-only vector of fixed-size records
//! - [`TimeIndex`]: In-memory B+ tree mapping timestamp to row index
//! - [`Series`]: Per-symbol engine combining three columns, the index,
//!   and a background writer with a drainable queue
//!
//! # Example
//!
//! ```rust,ignore
//! use tickdb::Series;
//!
//! let series = Series::open("/var/lib/tickdb", "AAPL")?;
//!
//! // Enqueue ticks; the background writer commits them in batches.
//! series.append(1_700_000_000, 189.25, 300)?;
//! series.append_batch(&more_ticks)?;
//!
//! // Wait for the queue to drain, then query.
//! series.sync()?;
//! let window = series.query_range(1_700_000_000, 1_700_000_060)?;
//! let tail = series.query_last(100)?;
//! ```

#![deny(missing_docs)]

pub mod column;
pub mod error;
pub mod index;
pub mod series;

pub use column::Column;
pub use error::{Result, TickError};
pub use index::TimeIndex;
pub use series::{FlushMode, Series, SeriesConfig, Tick};
