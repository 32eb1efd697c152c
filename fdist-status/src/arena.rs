// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Typed record arenas over shared mappings.
//!
//! An arena is a mapped file holding a fixed header followed by `count`
//! records of one `#[repr(C)]` type. The header carries a layout version
//! (mismatch is surfaced as `IncorrectVersion`, never migrated silently)
//! and a generation word that is bumped on every resize so detached
//! observers can notice their mapping went stale.

use crate::lock::{self, LockMode, LockRank, RecordGuard};
use crate::mmap::MappedRegion;
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Marker for types that may live inside an arena.
///
/// # Safety
/// Implementors must be plain old data: `#[repr(C)]`, no padding that
/// carries meaning, valid for any bit pattern, with an 8-byte-aligned
/// size.
pub unsafe trait Record: Copy + 'static {
    const MAGIC: u32;
    const VERSION: u32;
    const RANK: LockRank;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bad magic 0x{found:08x} (expected 0x{expected:08x})")]
    BadMagic { found: u32, expected: u32 },
    #[error("incorrect version {found} (expected {expected})")]
    IncorrectVersion { found: u32, expected: u32 },
    #[error("mapping is stale, re-attach required")]
    Stale,
    #[error("record index {index} out of range (count {count})")]
    OutOfRange { index: usize, count: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ArenaHeader {
    magic: u32,
    version: u32,
    generation: u32,
    feature_flags: u32,
    count: u32,
    reserved: u32,
    created: i64,
}

const HEADER_LEN: usize = std::mem::size_of::<ArenaHeader>();
const GENERATION_OFFSET: u64 = 8;

pub struct Arena<T: Record> {
    region: MappedRegion,
    file: File,
    path: PathBuf,
    cached_generation: u32,
    _marker: PhantomData<T>,
}

impl<T: Record> Arena<T> {
    /// Create (or re-create) the backing file sized for `count` records.
    pub fn create(path: &Path, count: usize, feature_flags: u32) -> Result<Arena<T>, StoreError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let len = HEADER_LEN + count * std::mem::size_of::<T>();
        let mut region = MappedRegion::create(&file, len)?;
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let header = ArenaHeader {
            magic: T::MAGIC,
            version: T::VERSION,
            generation: 1,
            feature_flags,
            count: count as u32,
            reserved: 0,
            created,
        };
        // Safety: the region is at least HEADER_LEN long and writable.
        unsafe {
            std::ptr::write(region.as_slice_mut().as_mut_ptr() as *mut ArenaHeader, header);
        }
        region.as_slice_mut()[HEADER_LEN..len].fill(0);
        region.sync()?;
        Ok(Arena {
            region,
            file,
            path: path.to_path_buf(),
            cached_generation: 1,
            _marker: PhantomData,
        })
    }

    /// Map an existing arena, verifying magic and layout version.
    pub fn attach(path: &Path) -> Result<Arena<T>, StoreError> {
        let file = File::options().read(true).write(true).open(path)?;
        let region = MappedRegion::open(&file)?;
        let arena = Arena {
            region,
            file,
            path: path.to_path_buf(),
            cached_generation: 0,
            _marker: PhantomData,
        };
        let header = arena.header();
        if header.magic != T::MAGIC {
            return Err(StoreError::BadMagic {
                found: header.magic,
                expected: T::MAGIC,
            });
        }
        if header.version != T::VERSION {
            return Err(StoreError::IncorrectVersion {
                found: header.version,
                expected: T::VERSION,
            });
        }
        let generation = header.generation;
        Ok(Arena {
            cached_generation: generation,
            ..arena
        })
    }

    /// Unmap, optionally flushing first.
    pub fn detach(self, sync: bool) -> Result<(), StoreError> {
        if sync {
            self.region.sync_blocking()?;
        }
        Ok(())
    }

    fn header(&self) -> &ArenaHeader {
        // Safety: the region is at least HEADER_LEN long and the header is
        // written on create.
        unsafe { &*(self.region.as_slice().as_ptr() as *const ArenaHeader) }
    }

    fn header_mut(&mut self) -> &mut ArenaHeader {
        // Safety: as above, and we hold the only &mut.
        unsafe { &mut *(self.region.as_slice_mut().as_mut_ptr() as *mut ArenaHeader) }
    }

    pub fn count(&self) -> usize {
        self.header().count as usize
    }

    pub fn feature_flags(&self) -> u32 {
        self.header().feature_flags
    }

    pub fn set_feature_flags(&mut self, flags: u32) {
        self.header_mut().feature_flags = flags;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when another attachment resized the arena since we mapped it.
    /// Reads the generation word from the file, not the (possibly dead)
    /// mapping.
    pub fn is_stale(&self) -> Result<bool, StoreError> {
        let mut buf = [0u8; 4];
        self.file.read_exact_at(&mut buf, GENERATION_OFFSET)?;
        Ok(u32::from_ne_bytes(buf) != self.cached_generation)
    }

    /// Drop the stale mapping and map the file again.
    pub fn reattach(self) -> Result<Arena<T>, StoreError> {
        let path = self.path.clone();
        drop(self);
        Arena::attach(&path)
    }

    fn record_offset(index: usize) -> usize {
        HEADER_LEN + index * std::mem::size_of::<T>()
    }

    fn check_index(&self, index: usize) -> Result<(), StoreError> {
        let count = self.count();
        if index >= count {
            return Err(StoreError::OutOfRange { index, count });
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<&T, StoreError> {
        self.check_index(index)?;
        let offset = Self::record_offset(index);
        // Safety: index is in range, records are POD, the mapping outlives
        // the returned borrow.
        Ok(unsafe { &*(self.region.as_slice().as_ptr().add(offset) as *const T) })
    }

    /// Mutable access. Refuses on a stale mapping so a writer can never
    /// scribble over pages another attachment already abandoned.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T, StoreError> {
        if self.is_stale()? {
            return Err(StoreError::Stale);
        }
        self.check_index(index)?;
        let offset = Self::record_offset(index);
        // Safety: as in `get`, plus exclusive access through &mut self.
        Ok(unsafe { &mut *(self.region.as_slice_mut().as_mut_ptr().add(offset) as *mut T) })
    }

    /// Byte-range lock over one record. Blocks until granted.
    pub fn lock_record(&self, index: usize, mode: LockMode) -> Result<RecordGuard, StoreError> {
        self.check_index(index)?;
        let offset = Self::record_offset(index) as i64;
        Ok(lock::lock_range(
            self.file.as_raw_fd(),
            offset,
            std::mem::size_of::<T>() as i64,
            mode,
            T::RANK,
        )?)
    }

    /// Exclusive lock over the whole arena, used for structural changes
    /// like compaction.
    pub fn lock_all(&self, mode: LockMode) -> Result<RecordGuard, StoreError> {
        // Length zero locks to end of file.
        Ok(lock::lock_range(
            self.file.as_raw_fd(),
            0,
            0,
            mode,
            T::RANK,
        )?)
    }

    /// Non-blocking variant; `Ok(None)` when another process holds it.
    pub fn try_lock_record(
        &self,
        index: usize,
        mode: LockMode,
    ) -> Result<Option<RecordGuard>, StoreError> {
        self.check_index(index)?;
        let offset = Self::record_offset(index) as i64;
        Ok(lock::try_lock_range(
            self.file.as_raw_fd(),
            offset,
            std::mem::size_of::<T>() as i64,
            mode,
            T::RANK,
        )?)
    }

    /// Grow or shrink to `new_count` records, bumping the generation so
    /// other attachments observe `Stale` and re-attach. Existing records
    /// are preserved; new space is zeroed, shrinking discards the tail.
    pub fn resize(&mut self, new_count: usize) -> Result<(), StoreError> {
        let old_count = self.count();
        let generation = self.header().generation.wrapping_add(1);
        let feature_flags = self.header().feature_flags;
        let created = self.header().created;
        let new_len = Self::record_offset(new_count);
        let keep_len = Self::record_offset(old_count.min(new_count));
        let kept = self.region.as_slice()[HEADER_LEN..keep_len].to_vec();

        // The fresh mapping briefly coexists with the old one; the old
        // pages go away on assignment below and are never touched again.
        let mut region = MappedRegion::create(&self.file, new_len)?;
        let header = ArenaHeader {
            magic: T::MAGIC,
            version: T::VERSION,
            generation,
            feature_flags,
            count: new_count as u32,
            reserved: 0,
            created,
        };
        // Safety: freshly mapped region of at least HEADER_LEN bytes.
        unsafe {
            std::ptr::write(region.as_slice_mut().as_mut_ptr() as *mut ArenaHeader, header);
        }
        region.as_slice_mut()[HEADER_LEN..HEADER_LEN + kept.len()].copy_from_slice(&kept);
        region.as_slice_mut()[HEADER_LEN + kept.len()..new_len].fill(0);
        region.sync()?;
        tracing::debug!(
            "resized {} from {} to {} records",
            self.path.display(),
            old_count,
            new_count
        );
        self.region = region;
        self.cached_generation = generation;
        Ok(())
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        self.region.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct TestRecord {
        value: u64,
        flags: u32,
        _pad: u32,
    }

    unsafe impl Record for TestRecord {
        const MAGIC: u32 = 0x74657374;
        const VERSION: u32 = 7;
        const RANK: LockRank = LockRank::Host;
    }

    #[test]
    fn test_create_attach_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena");
        let mut arena: Arena<TestRecord> = Arena::create(&path, 4, 0).unwrap();
        assert_eq!(arena.count(), 4);
        arena.get_mut(2).unwrap().value = 42;
        arena.sync().unwrap();

        let other: Arena<TestRecord> = Arena::attach(&path).unwrap();
        assert_eq!(other.get(2).unwrap().value, 42);
        assert_eq!(other.get(0).unwrap().value, 0);
    }

    #[test]
    fn test_version_mismatch_is_surfaced() {
        #[repr(C)]
        #[derive(Clone, Copy)]
        struct OtherVersion {
            value: u64,
            flags: u32,
            _pad: u32,
        }
        unsafe impl Record for OtherVersion {
            const MAGIC: u32 = 0x74657374;
            const VERSION: u32 = 8;
            const RANK: LockRank = LockRank::Host;
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena");
        let arena: Arena<TestRecord> = Arena::create(&path, 1, 0).unwrap();
        drop(arena);
        match Arena::<OtherVersion>::attach(&path) {
            Err(StoreError::IncorrectVersion { found: 7, expected: 8 }) => {}
            other => panic!("expected IncorrectVersion, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_resize_marks_other_attachment_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena");
        let mut arena: Arena<TestRecord> = Arena::create(&path, 2, 0).unwrap();
        arena.get_mut(1).unwrap().value = 99;
        let mut observer: Arena<TestRecord> = Arena::attach(&path).unwrap();
        assert!(!observer.is_stale().unwrap());

        arena.resize(8).unwrap();
        assert_eq!(arena.count(), 8);
        // Existing records survive the resize, new ones are zeroed.
        assert_eq!(arena.get(1).unwrap().value, 99);
        assert_eq!(arena.get(7).unwrap().value, 0);
        assert!(observer.is_stale().unwrap());
        assert!(matches!(observer.get_mut(0), Err(StoreError::Stale)));

        let observer = observer.reattach().unwrap();
        assert_eq!(observer.count(), 8);
        assert!(!observer.is_stale().unwrap());
    }

    #[test]
    fn test_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let arena: Arena<TestRecord> = Arena::create(&dir.path().join("a"), 2, 0).unwrap();
        assert!(matches!(
            arena.get(2),
            Err(StoreError::OutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_record_lock_guard_releases() {
        let dir = tempfile::tempdir().unwrap();
        let arena: Arena<TestRecord> = Arena::create(&dir.path().join("a"), 2, 0).unwrap();
        let guard = arena.lock_record(1, LockMode::Exclusive).unwrap();
        drop(guard);
        let again = arena.try_lock_record(1, LockMode::Exclusive).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_feature_flags_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena");
        let mut arena: Arena<TestRecord> = Arena::create(&path, 1, 0b10).unwrap();
        assert_eq!(arena.feature_flags(), 0b10);
        arena.set_feature_flags(0b11);
        drop(arena);
        let arena: Arena<TestRecord> = Arena::attach(&path).unwrap();
        assert_eq!(arena.feature_flags(), 0b11);
    }
}
