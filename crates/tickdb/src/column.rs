//! Memory-mapped append-only column storage.
//!
//! A [`Column`] persists a sequence of fixed-size records in a single file
//! and keeps the whole file mapped for zero-copy reads.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Count Header (8 bytes, little-endian u64)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Element 0 (element_size bytes)                              │
//! │  Element 1                                                   │
//! │  ...                                                         │
//! │  Element capacity-1 (reserved slots are zero-filled)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only `count` elements are logically present; the remaining slots are
//! reserved space created by chunked file extension. The file size is
//! always `HEADER_SIZE + capacity * element_size`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, warn};

use crate::error::{Result, TickError};

/// Size of the persistent count header at the start of every column file.
pub const HEADER_SIZE: u64 = 8;

/// Growth granularity in bytes; new files are allocated one chunk of slots.
pub const GROWTH_CHUNK: u64 = 4096;

/// An append-only vector of fixed-size records backed by a memory-mapped
/// file.
///
/// Appends reserve the next slot, copy the payload, and only then advance
/// the in-memory count, so a reader that observes `count == K` sees the
/// bytes of all slots `0..K-1`. The persisted header is written by
/// [`Column::flush_header`]; callers batching appends flush once per batch.
///
/// Growth remaps the file, which invalidates previously returned read
/// slices. The caller must not hold a slice from [`Column::read`] across an
/// append; the series enforces this with its shared/exclusive lock.
#[derive(Debug)]
pub struct Column {
    path: PathBuf,
    file: std::fs::File,
    mmap: MmapMut,
    element_size: u64,
    count: u64,
    capacity: u64,
}

impl Column {
    /// Opens or creates the column file at `path`.
    ///
    /// A new file is extended to one growth chunk worth of slots (at least
    /// one) and its header initialized to zero. An existing file must be
    /// large enough to hold the header and carry a count no greater than
    /// the capacity implied by its size.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::IoError`] if the file cannot be opened,
    /// extended, or mapped, and [`TickError::CorruptHeader`] if an existing
    /// file fails validation.
    pub fn open(path: impl AsRef<Path>, element_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        assert!(element_size > 0, "element_size must be non-zero");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();

        if file_size == 0 {
            // Fresh file: pre-allocate one chunk of slots.
            let capacity = (GROWTH_CHUNK / element_size).max(1);
            file.set_len(HEADER_SIZE + capacity * element_size)?;

            let mut mmap = unsafe { MmapMut::map_mut(&file)? };
            mmap[..HEADER_SIZE as usize].copy_from_slice(&0u64.to_le_bytes());

            debug!(path = %path.display(), capacity, "created column file");
            return Ok(Self {
                path,
                file,
                mmap,
                element_size,
                count: 0,
                capacity,
            });
        }

        if file_size < HEADER_SIZE {
            return Err(TickError::CorruptHeader {
                path,
                reason: format!("file size {} is smaller than the header", file_size),
            });
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let count = u64::from_le_bytes(mmap[..HEADER_SIZE as usize].try_into().unwrap());
        let capacity = (file_size - HEADER_SIZE) / element_size;

        if count > capacity {
            return Err(TickError::CorruptHeader {
                path,
                reason: format!("count {} exceeds capacity {}", count, capacity),
            });
        }

        debug!(path = %path.display(), count, capacity, "opened column file");
        Ok(Self {
            path,
            file,
            mmap,
            element_size,
            count,
            capacity,
        })
    }

    /// Returns the logical number of elements.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the number of physical slots available before the next
    /// growth.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the fixed record size in bytes.
    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a single element and returns its slot index.
    ///
    /// Grows the file first if all slots are in use.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::IoError`] if growth or the flush hint fails.
    pub fn append(&mut self, element: &[u8]) -> Result<u64> {
        debug_assert_eq!(element.len() as u64, self.element_size);
        self.append_batch(element)
    }

    /// Appends `data.len() / element_size` consecutive elements and returns
    /// the slot index of the first.
    ///
    /// The block is copied into contiguous slots and an asynchronous flush
    /// hint is issued for the written range. The in-memory count advances
    /// only after the copy completes.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::IoError`] if growth or the flush hint fails.
    pub fn append_batch(&mut self, data: &[u8]) -> Result<u64> {
        debug_assert_eq!(data.len() as u64 % self.element_size, 0);
        let n = data.len() as u64 / self.element_size;
        if n == 0 {
            return Ok(self.count);
        }

        self.ensure_capacity(self.count + n)?;

        let start = self.count;
        let offset = self.slot_offset(start);
        self.mmap[offset..offset + data.len()].copy_from_slice(data);
        self.count = start + n;

        self.mmap.flush_async_range(offset, data.len())?;
        Ok(start)
    }

    /// Reads the element at `index` as a borrowed slice into the mapping.
    ///
    /// The slice is only valid until the next append; callers that need the
    /// bytes past that point must copy them out.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::OutOfRange`] if `index >= count()`.
    pub fn read(&self, index: u64) -> Result<&[u8]> {
        if index >= self.count {
            return Err(TickError::OutOfRange {
                index,
                count: self.count,
            });
        }
        let offset = self.slot_offset(index);
        Ok(&self.mmap[offset..offset + self.element_size as usize])
    }

    /// Writes the current count into the header and issues an asynchronous
    /// flush hint for it.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::IoError`] if the flush hint fails.
    pub fn flush_header(&mut self) -> Result<()> {
        self.mmap[..HEADER_SIZE as usize].copy_from_slice(&self.count.to_le_bytes());
        self.mmap.flush_async_range(0, HEADER_SIZE as usize)?;
        Ok(())
    }

    /// Writes the header and synchronously flushes the whole mapping.
    ///
    /// This is the durability boundary: when it returns, the header and all
    /// appended elements have been handed to the operating system with a
    /// blocking msync.
    ///
    /// # Errors
    ///
    /// Returns [`TickError::IoError`] if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.mmap[..HEADER_SIZE as usize].copy_from_slice(&self.count.to_le_bytes());
        self.mmap.flush()?;
        Ok(())
    }

    /// Grows the file until at least `required` slots exist.
    ///
    /// The new capacity is the largest of: one more chunk, double the
    /// current capacity, and `required`. Growth remaps the file; the old
    /// mapping is dropped after the new one is established.
    fn ensure_capacity(&mut self, required: u64) -> Result<()> {
        if required <= self.capacity {
            return Ok(());
        }

        let new_capacity = grown_capacity(self.capacity, self.element_size, required);
        self.file
            .set_len(HEADER_SIZE + new_capacity * self.element_size)?;

        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        debug!(
            path = %self.path.display(),
            old_capacity = self.capacity,
            new_capacity,
            "grew column file"
        );
        self.capacity = new_capacity;
        Ok(())
    }

    fn slot_offset(&self, index: u64) -> usize {
        (HEADER_SIZE + index * self.element_size) as usize
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        // Best effort to persist the header before unmapping.
        if let Err(err) = self.flush() {
            warn!(path = %self.path.display(), "failed to flush column on drop: {err:?}");
        }
    }
}

/// Computes the post-growth capacity for a column.
fn grown_capacity(capacity: u64, element_size: u64, required: u64) -> u64 {
    let chunk_slots = (GROWTH_CHUNK / element_size).max(1);
    (capacity + chunk_slots).max(capacity * 2).max(required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_grown_capacity_chunk_vs_double() {
        // Small columns grow by a whole chunk, large ones double.
        assert_eq!(grown_capacity(512, 8, 513), 1024);
        assert_eq!(grown_capacity(4096, 8, 4097), 8192);
        // An oversized reservation wins outright.
        assert_eq!(grown_capacity(512, 8, 100_000), 100_000);
    }

    #[test]
    fn test_new_file_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("col.bin");
        let col = Column::open(&path, 8).unwrap();

        assert_eq!(col.count(), 0);
        assert_eq!(col.capacity(), GROWTH_CHUNK / 8);

        let file_size = std::fs::metadata(&path).unwrap().len();
        assert_eq!(file_size, HEADER_SIZE + col.capacity() * 8);
    }

    #[test]
    fn test_append_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut col = Column::open(dir.path().join("col.bin"), 8).unwrap();

        for i in 0u64..100 {
            let slot = col.append(&i.to_le_bytes()).unwrap();
            assert_eq!(slot, i);
        }
        assert_eq!(col.count(), 100);

        for i in 0u64..100 {
            let bytes = col.read(i).unwrap();
            assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), i);
        }
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mut col = Column::open(dir.path().join("col.bin"), 8).unwrap();
        col.append(&1u64.to_le_bytes()).unwrap();

        let err = col.read(1).unwrap_err();
        assert!(matches!(err, TickError::OutOfRange { index: 1, count: 1 }));
    }

    #[test]
    fn test_rejects_truncated_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("col.bin");
        std::fs::write(&path, [0u8; 4]).unwrap();

        let err = Column::open(&path, 8).unwrap_err();
        assert!(matches!(err, TickError::CorruptHeader { .. }));
    }

    #[test]
    fn test_rejects_implausible_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("col.bin");
        // Header claims 999 elements but the file has room for one.
        let mut bytes = 999u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, &bytes).unwrap();

        let err = Column::open(&path, 8).unwrap_err();
        assert!(matches!(err, TickError::CorruptHeader { .. }));
    }
}
