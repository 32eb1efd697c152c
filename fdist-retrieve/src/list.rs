// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The persisted retrieve list of one remote directory.
//!
//! A growable record arena under `files/incoming/ls_data/<alias>`.
//! Each entry remembers what was last known about one remote file and
//! whether it has been fetched or assigned to a worker. Entries are
//! mutated under per-entry byte-range locks; compaction takes the
//! list-wide lock.

use fdist_common::MAX_FILENAME_LENGTH;
use fdist_status::{Arena, LockMode, LockRank, Record, RecordGuard, StoreError};
use std::path::Path;

/// Allocation step: the list grows this many entries at a time.
const LIST_STEP_SIZE: usize = 10;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RetrieveRecord {
    pub file_name: [u8; MAX_FILENAME_LENGTH],
    /// -1 while unknown.
    pub size: i64,
    /// -1 while unknown.
    pub mtime: i64,
    pub got_date: u8,
    pub retrieved: u8,
    pub in_list: u8,
    /// Zero means unassigned, otherwise job number + 1.
    pub assigned: u8,
    pub _pad: [u8; 4],
}

unsafe impl Record for RetrieveRecord {
    const MAGIC: u32 = u32::from_be_bytes(*b"RLST");
    const VERSION: u32 = 1;
    const RANK: LockRank = LockRank::RetrieveList;
}

impl RetrieveRecord {
    pub fn name(&self) -> &str {
        let end = self
            .file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.file_name.len());
        std::str::from_utf8(&self.file_name[..end]).unwrap_or("")
    }

    fn occupied(&self) -> bool {
        self.file_name[0] != 0
    }
}

pub struct RetrieveList {
    arena: Arena<RetrieveRecord>,
}

impl RetrieveList {
    /// Attach the list of a directory, creating it when first seen.
    pub fn open(path: &Path) -> Result<RetrieveList, StoreError> {
        let arena = if path.exists() {
            Arena::attach(path)?
        } else {
            Arena::create(path, LIST_STEP_SIZE, 0)?
        };
        Ok(RetrieveList { arena })
    }

    /// Number of listed files.
    pub fn len(&self) -> usize {
        (0..self.arena.count())
            .filter(|&i| self.arena.get(i).map(|r| r.occupied()).unwrap_or(false))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot indices of every listed file.
    pub fn occupied(&self) -> Vec<usize> {
        (0..self.arena.count())
            .filter(|&i| self.arena.get(i).map(|r| r.occupied()).unwrap_or(false))
            .collect()
    }

    pub fn get(&self, index: usize) -> Result<RetrieveRecord, StoreError> {
        Ok(*self.arena.get(index)?)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        (0..self.arena.count())
            .find(|&i| matches!(self.arena.get(i), Ok(r) if r.occupied() && r.name() == name))
    }

    /// Mutate one entry in place.
    pub fn update<F: FnOnce(&mut RetrieveRecord)>(
        &mut self,
        index: usize,
        mutate: F,
    ) -> Result<(), StoreError> {
        mutate(self.arena.get_mut(index)?);
        Ok(())
    }

    /// Per-entry lock; `None` when another worker holds the entry.
    pub fn try_lock_entry(&self, index: usize) -> Result<Option<RecordGuard>, StoreError> {
        self.arena.try_lock_record(index, LockMode::Exclusive)
    }

    /// Append a new entry, growing the arena by a step when full.
    pub fn append(&mut self, name: &str) -> Result<usize, StoreError> {
        let free = (0..self.arena.count())
            .find(|&i| self.arena.get(i).map(|r| !r.occupied()).unwrap_or(false));
        let index = match free {
            Some(index) => index,
            None => {
                let old_count = self.arena.count();
                self.arena.resize(old_count + LIST_STEP_SIZE)?;
                old_count
            }
        };
        let record = self.arena.get_mut(index)?;
        *record = RetrieveRecord {
            file_name: [0; MAX_FILENAME_LENGTH],
            size: -1,
            mtime: -1,
            got_date: 0,
            retrieved: 0,
            in_list: 1,
            assigned: 0,
            _pad: [0; 4],
        };
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_FILENAME_LENGTH - 1);
        record.file_name[..len].copy_from_slice(&bytes[..len]);
        Ok(index)
    }

    /// Drop the entry again (an appended candidate that turned out to be
    /// ineligible is not persisted).
    pub fn remove(&mut self, index: usize) -> Result<(), StoreError> {
        self.arena.get_mut(index)?.file_name = [0; MAX_FILENAME_LENGTH];
        Ok(())
    }

    /// Clear every `in_list` flag ahead of a fresh scan.
    pub fn begin_scan(&mut self) -> Result<(), StoreError> {
        for index in self.occupied() {
            self.arena.get_mut(index)?.in_list = 0;
        }
        Ok(())
    }

    /// Delete every entry the last scan did not see. Holds the list-wide
    /// write lock for the duration.
    pub fn compact(&mut self) -> Result<(), StoreError> {
        let _guard = self.arena.lock_all(LockMode::Exclusive)?;
        for index in self.occupied() {
            let record = self.arena.get_mut(index)?;
            if record.in_list == 0 {
                record.file_name = [0; MAX_FILENAME_LENGTH];
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        self.arena.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_find_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("alias")).unwrap();
        assert!(list.is_empty());

        let index = list.append("file.dat").unwrap();
        list.update(index, |record| {
            record.size = 5 * 1024;
            record.mtime = 1_577_880_000;
            record.got_date = 1;
        })
        .unwrap();

        assert_eq!(list.len(), 1);
        assert_eq!(list.find("file.dat"), Some(index));
        assert_eq!(list.find("missing"), None);
        let record = list.get(index).unwrap();
        assert_eq!(record.name(), "file.dat");
        assert_eq!(record.size, 5 * 1024);
    }

    #[test]
    fn test_grows_past_step_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("alias")).unwrap();
        for i in 0..(LIST_STEP_SIZE * 2 + 3) {
            list.append(&format!("file{i}")).unwrap();
        }
        assert_eq!(list.len(), LIST_STEP_SIZE * 2 + 3);
        assert!(list.find("file21").is_some());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alias");
        {
            let mut list = RetrieveList::open(&path).unwrap();
            let index = list.append("sticky").unwrap();
            list.update(index, |r| r.retrieved = 1).unwrap();
            list.sync().unwrap();
        }
        let list = RetrieveList::open(&path).unwrap();
        let index = list.find("sticky").unwrap();
        assert_eq!(list.get(index).unwrap().retrieved, 1);
    }

    #[test]
    fn test_compaction_keeps_in_list_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("alias")).unwrap();
        let keep = list.append("keep").unwrap();
        let drop_index = list.append("drop").unwrap();
        list.begin_scan().unwrap();
        list.update(keep, |r| r.in_list = 1).unwrap();
        list.update(drop_index, |r| r.in_list = 0).unwrap();

        list.compact().unwrap();
        assert_eq!(list.len(), 1);
        assert!(list.find("keep").is_some());
        assert!(list.find("drop").is_none());
    }

    #[test]
    fn test_removed_candidate_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = RetrieveList::open(&dir.path().join("alias")).unwrap();
        let index = list.append("transient").unwrap();
        list.remove(index).unwrap();
        assert!(list.is_empty());
        // The slot is reusable.
        let again = list.append("next").unwrap();
        assert_eq!(again, index);
    }
}
