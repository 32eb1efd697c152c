// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Byte-range record locks.
//!
//! POSIX record locks (`fcntl` `F_SETLK`/`F_SETLKW`) over the region of a
//! single record. The guard releases the range on drop. Lock ordering
//! across the different stores (host before directory before global before
//! retrieve list) is asserted in debug builds through a per-thread rank
//! stack.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Acquisition rank, ordered the only direction locks may nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockRank {
    Host = 0,
    Directory = 1,
    Global = 2,
    RetrieveList = 3,
}

thread_local! {
    static HELD_RANKS: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

fn push_rank(rank: LockRank) {
    HELD_RANKS.with(|held| {
        let held = held.borrow();
        if let Some(&last) = held.last() {
            debug_assert!(
                rank >= last,
                "lock ordering violation: acquiring {rank:?} while holding {last:?}"
            );
        }
        drop(held);
    });
    HELD_RANKS.with(|held| held.borrow_mut().push(rank));
}

fn pop_rank(rank: LockRank) {
    HELD_RANKS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|&r| r == rank) {
            held.remove(pos);
        }
    });
}

/// A held byte-range lock. Dropping the guard unlocks the range.
#[derive(Debug)]
pub struct RecordGuard {
    fd: RawFd,
    offset: i64,
    len: i64,
    rank: LockRank,
}

fn flock(kind: i16, offset: i64, len: i64) -> libc::flock {
    // Safety: flock is plain data; zeroing gives a valid initial state.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = offset;
    fl.l_len = len;
    fl
}

/// Block until the range is locked.
pub fn lock_range(
    fd: RawFd,
    offset: i64,
    len: i64,
    mode: LockMode,
    rank: LockRank,
) -> io::Result<RecordGuard> {
    let kind = match mode {
        LockMode::Shared => libc::F_RDLCK,
        LockMode::Exclusive => libc::F_WRLCK,
    };
    let fl = flock(kind as i16, offset, len);
    loop {
        // Safety: fd is open, fl points at a valid flock.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
        if rc == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
    push_rank(rank);
    Ok(RecordGuard {
        fd,
        offset,
        len,
        rank,
    })
}

/// Non-blocking acquisition; `Ok(None)` means somebody else holds it.
pub fn try_lock_range(
    fd: RawFd,
    offset: i64,
    len: i64,
    mode: LockMode,
    rank: LockRank,
) -> io::Result<Option<RecordGuard>> {
    let kind = match mode {
        LockMode::Shared => libc::F_RDLCK,
        LockMode::Exclusive => libc::F_WRLCK,
    };
    let fl = flock(kind as i16, offset, len);
    // Safety: fd is open, fl points at a valid flock.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
    if rc == 0 {
        push_rank(rank);
        return Ok(Some(RecordGuard {
            fd,
            offset,
            len,
            rank,
        }));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EAGAIN) => Ok(None),
        _ => Err(err),
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        let fl = flock(libc::F_UNLCK as i16, self.offset, self.len);
        // Safety: unlocking a range we hold; failure here leaves the lock
        // to die with the descriptor.
        unsafe {
            _ = libc::fcntl(self.fd, libc::F_SETLK, &fl);
        }
        pop_rank(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_lock_and_relock_same_process() {
        // POSIX record locks are per-process, so re-locking the same range
        // on another descriptor of the same file succeeds. What we can
        // check single-process: guards release their range on drop and the
        // rank stack stays balanced.
        let file = tempfile::tempfile().unwrap();
        file.set_len(1024).unwrap();
        let fd = file.as_raw_fd();

        let g1 = lock_range(fd, 0, 64, LockMode::Exclusive, LockRank::Host).unwrap();
        let g2 = lock_range(fd, 64, 64, LockMode::Exclusive, LockRank::Directory).unwrap();
        drop(g2);
        drop(g1);
        let _g3 = try_lock_range(fd, 0, 64, LockMode::Exclusive, LockRank::Host)
            .unwrap()
            .expect("range should be free again");
    }

    #[test]
    #[should_panic(expected = "lock ordering violation")]
    #[cfg(debug_assertions)]
    fn test_rank_ordering_asserts() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(1024).unwrap();
        let fd = file.as_raw_fd();

        let _list = lock_range(fd, 0, 8, LockMode::Exclusive, LockRank::RetrieveList).unwrap();
        // Host after list is the forbidden direction.
        let _host = lock_range(fd, 8, 8, LockMode::Exclusive, LockRank::Host).unwrap();
    }
}
