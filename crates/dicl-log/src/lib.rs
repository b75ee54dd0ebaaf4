//! The persistent log (C2): an append-only arena of page-sized blobs backed by a memory-mapped
//! file, standing in for the PMem object pool the real allocator would provide (the allocator's
//! own internals are out of scope for this repository — see SPEC_FULL.md §1).
//!
//! Rationale (kept from the distilled spec): the log stays append-only during a request so that
//! commit can be described as "index insert after persist" — a crash between persisting a log
//! entry and inserting it into the index leaks log space, but never surfaces torn data.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use memmap2::MmapMut;
use thiserror::Error;

/// Magic bytes identifying a log pool file, written at the start of the header.
const MAGIC: [u8; 8] = *b"DICLLOG1";
/// Header: 8-byte magic + 8-byte cursor, padded up to one cache line.
const HEADER_SIZE: u64 = 64;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log pool is full (capacity {capacity} bytes)")]
    Full { capacity: u64 },
    #[error("requested log pool size {requested} is smaller than the header ({header})")]
    TooSmall { requested: u64, header: u64 },
    #[error("log pool file has a bad magic header; not a DICL log pool")]
    BadMagic,
    #[error("log address {addr} + length {len} is out of bounds for a read")]
    OutOfBounds { addr: u64, len: usize },
    #[error("io error opening or growing the log pool")]
    Io(#[from] io::Error),
}

/// A stable, pool-relative address of a [`LogEntry`]. Valid until the pool is dropped (no
/// explicit free is used by the dispatcher today; see SPEC_FULL.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogAddress(pub u64);

struct Inner {
    mmap: MmapMut,
    /// Next free byte offset within the data region (i.e. excluding the header).
    cursor: u64,
}

/// The persistent log pool. Single-writer by construction (the dispatcher is the only thread
/// that ever calls [`LogPool::alloc_and_persist`]), so a single mutex guarding both the cursor
/// and the backing mapping is sufficient and simpler than a lock-free bump allocator.
pub struct LogPool {
    inner: Mutex<Inner>,
    capacity: u64,
}

impl LogPool {
    /// Opens the pool at `path`, creating it with `size` bytes of capacity if it does not yet
    /// exist. Reopening an existing pool preserves all previously persisted log entries and
    /// resumes the bump allocator from its last durably recorded cursor.
    pub fn open_or_create(path: impl AsRef<Path>, size: u64) -> Result<LogPool, LogError> {
        if size <= HEADER_SIZE {
            return Err(LogError::TooSmall {
                requested: size,
                header: HEADER_SIZE,
            });
        }
        let path = path.as_ref();
        let existed = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if !existed {
            file.set_len(size)?;
        }
        let len = file.metadata()?.len();
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let cursor = if existed {
            if mmap[0..8] != MAGIC {
                return Err(LogError::BadMagic);
            }
            u64::from_ne_bytes(mmap[8..16].try_into().unwrap())
        } else {
            mmap[0..8].copy_from_slice(&MAGIC);
            mmap[8..16].copy_from_slice(&0u64.to_ne_bytes());
            mmap.flush_range(0, HEADER_SIZE as usize)?;
            0
        };

        tracing::info!(path = %path.display(), len, cursor, "log pool opened");

        Ok(LogPool {
            capacity: len - HEADER_SIZE,
            inner: Mutex::new(Inner { mmap, cursor }),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Allocates `data.len()` contiguous bytes in the pool, copies `data` in, flushes the range,
    /// and returns the pool-local address. The returned address remains valid until the pool
    /// itself is destroyed (no explicit free is used by the dispatcher today).
    pub fn alloc_and_persist(&self, data: &[u8]) -> Result<LogAddress, LogError> {
        let len = data.len() as u64;
        let mut inner = self.inner.lock().unwrap();

        let offset = inner.cursor;
        if offset.checked_add(len).map_or(true, |end| end > self.capacity) {
            return Err(LogError::Full {
                capacity: self.capacity,
            });
        }

        let start = (HEADER_SIZE + offset) as usize;
        inner.mmap[start..start + data.len()].copy_from_slice(data);
        inner.mmap.flush_range(start, data.len())?;

        inner.cursor = offset + len;
        inner.mmap[8..16].copy_from_slice(&inner.cursor.to_ne_bytes());
        inner.mmap.flush_range(8, 8)?;

        Ok(LogAddress(offset))
    }

    /// Copies `dst.len()` bytes starting at `addr` out of the pool.
    pub fn read_into(&self, addr: LogAddress, dst: &mut [u8]) -> Result<(), LogError> {
        let inner = self.inner.lock().unwrap();
        let start = (HEADER_SIZE + addr.0) as usize;
        let end = start
            .checked_add(dst.len())
            .filter(|&end| end as u64 <= HEADER_SIZE + self.capacity)
            .ok_or(LogError::OutOfBounds {
                addr: addr.0,
                len: dst.len(),
            })?;
        dst.copy_from_slice(&inner.mmap[start..end]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = LogPool::open_or_create(dir.path().join("log"), 1 << 20).unwrap();

        let page = vec![0xab; 4096];
        let addr = pool.alloc_and_persist(&page).unwrap();

        let mut out = vec![0u8; 4096];
        pool.read_into(addr, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn sequential_allocations_do_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let pool = LogPool::open_or_create(dir.path().join("log"), 1 << 20).unwrap();

        let a = pool.alloc_and_persist(&[1u8; 100]).unwrap();
        let b = pool.alloc_and_persist(&[2u8; 100]).unwrap();
        assert_ne!(a, b);

        let mut out = vec![0u8; 100];
        pool.read_into(a, &mut out).unwrap();
        assert_eq!(out, vec![1u8; 100]);
        pool.read_into(b, &mut out).unwrap();
        assert_eq!(out, vec![2u8; 100]);
    }

    #[test]
    fn full_pool_reports_full() {
        let dir = tempfile::tempdir().unwrap();
        let pool = LogPool::open_or_create(dir.path().join("log"), HEADER_SIZE + 128).unwrap();

        pool.alloc_and_persist(&[0u8; 100]).unwrap();
        let err = pool.alloc_and_persist(&[0u8; 100]).unwrap_err();
        assert!(matches!(err, LogError::Full { .. }));
    }

    #[test]
    fn reopen_preserves_prior_entries_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        let addr = {
            let pool = LogPool::open_or_create(&path, 1 << 20).unwrap();
            pool.alloc_and_persist(b"hi, dicl").unwrap()
        };

        let pool = LogPool::open_or_create(&path, 1 << 20).unwrap();
        let mut out = vec![0u8; 8];
        pool.read_into(addr, &mut out).unwrap();
        assert_eq!(&out, b"hi, dicl");

        // A fresh allocation after reopen must not collide with the one made before reopening.
        let fresh = pool.alloc_and_persist(b"more data").unwrap();
        assert_ne!(fresh, addr);
    }
}
