use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{DbError, Result};
use crate::page::BTreePageId;

pub type TransactionID = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockState {
    readers: HashSet<TransactionID>,
    writer: Option<TransactionID>,
    upgrade_request: Option<TransactionID>,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.upgrade_request.is_none()
    }
}

/// Page-level shared/exclusive lock table. Locks are held for the life of
/// a transaction and released in one batch at commit or abort.
///
/// A transaction holding the only shared lock on a page may upgrade it to
/// exclusive; the pending upgrade blocks new readers so the upgrader is
/// not starved. Waits are bounded; a transaction that cannot acquire a
/// lock within the timeout gets [`DbError::TransactionAborted`], which is
/// how deadlocks are broken.
pub struct LockTable {
    locks: Mutex<HashMap<BTreePageId, LockState>>,
    cond: Condvar,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            timeout,
        }
    }

    pub fn acquire_shared(&self, tid: TransactionID, pid: &BTreePageId) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut locks = self.locks.lock().unwrap();
        loop {
            let state = locks.entry(*pid).or_default();
            if state.writer == Some(tid) || state.readers.contains(&tid) {
                return Ok(());
            }
            let upgrade_pending = state
                .upgrade_request
                .map_or(false, |waiter| waiter != tid);
            if state.writer.is_none() && !upgrade_pending {
                state.readers.insert(tid);
                return Ok(());
            }
            locks = self.wait(locks, deadline, tid, pid)?;
        }
    }

    pub fn acquire_exclusive(&self, tid: TransactionID, pid: &BTreePageId) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut locks = self.locks.lock().unwrap();
        loop {
            let state = locks.entry(*pid).or_default();
            if state.writer == Some(tid) {
                return Ok(());
            }
            if state.readers.contains(&tid) {
                //  upgrade: wait until this transaction is the only reader
                state.upgrade_request = Some(tid);
                if state.readers.len() == 1 {
                    state.readers.remove(&tid);
                    state.writer = Some(tid);
                    state.upgrade_request = None;
                    return Ok(());
                }
            } else if state.writer.is_none()
                && state.readers.is_empty()
                && state.upgrade_request.is_none()
            {
                state.writer = Some(tid);
                return Ok(());
            }
            locks = self.wait(locks, deadline, tid, pid)?;
        }
    }

    fn wait<'a>(
        &self,
        locks: std::sync::MutexGuard<'a, HashMap<BTreePageId, LockState>>,
        deadline: Instant,
        tid: TransactionID,
        pid: &BTreePageId,
    ) -> Result<std::sync::MutexGuard<'a, HashMap<BTreePageId, LockState>>> {
        let now = Instant::now();
        if now >= deadline {
            debug!(tid, page = %pid, "lock wait timed out");
            return Err(DbError::TransactionAborted);
        }
        //  the caller's loop re-checks the lock state after every wake,
        //  including spurious ones and timeout expiry
        let (locks, _) = self.cond.wait_timeout(locks, deadline - now).unwrap();
        Ok(locks)
    }

    /// Release every lock (and pending upgrade) held by `tid`.
    pub fn release_all(&self, tid: TransactionID) {
        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, state| {
            state.readers.remove(&tid);
            if state.writer == Some(tid) {
                state.writer = None;
            }
            if state.upgrade_request == Some(tid) {
                state.upgrade_request = None;
            }
            !state.is_free()
        });
        self.cond.notify_all();
    }

    #[cfg(test)]
    fn holds_exclusive(&self, tid: TransactionID, pid: &BTreePageId) -> bool {
        let locks = self.locks.lock().unwrap();
        locks.get(pid).map_or(false, |s| s.writer == Some(tid))
    }
}

/// The locks one transaction holds, cached transaction-side so repeat
/// acquisitions never touch the shared table. Exclusive access is always
/// reached by upgrading from shared.
pub struct LockSet {
    tid: TransactionID,
    held: RefCell<HashMap<BTreePageId, LockType>>,
}

impl LockSet {
    pub fn new(tid: TransactionID) -> Self {
        Self {
            tid,
            held: RefCell::new(HashMap::new()),
        }
    }

    pub fn slock(&self, table: &LockTable, pid: &BTreePageId) -> Result<()> {
        if self.held.borrow().contains_key(pid) {
            return Ok(());
        }
        table.acquire_shared(self.tid, pid)?;
        self.held.borrow_mut().insert(*pid, LockType::Shared);
        Ok(())
    }

    pub fn xlock(&self, table: &LockTable, pid: &BTreePageId) -> Result<()> {
        if self.held.borrow().get(pid) == Some(&LockType::Exclusive) {
            return Ok(());
        }
        self.slock(table, pid)?;
        table.acquire_exclusive(self.tid, pid)?;
        self.held.borrow_mut().insert(*pid, LockType::Exclusive);
        Ok(())
    }

    pub fn holds(&self, pid: &BTreePageId) -> Option<LockType> {
        self.held.borrow().get(pid).copied()
    }

    pub fn release_all(&self, table: &LockTable) {
        table.release_all(self.tid);
        self.held.borrow_mut().clear();
    }
}

#[cfg(test)]
mod lock_table_tests {
    use super::*;
    use crate::page::PageCategory;
    use std::sync::Arc;

    fn pid(page_no: usize) -> BTreePageId {
        BTreePageId::new(1, page_no, PageCategory::Leaf)
    }

    fn short_table() -> LockTable {
        LockTable::new(Duration::from_millis(50))
    }

    #[test]
    fn test_shared_locks_are_compatible() {
        let table = short_table();
        table.acquire_shared(1, &pid(1)).unwrap();
        table.acquire_shared(2, &pid(1)).unwrap();
        table.acquire_shared(1, &pid(1)).unwrap();
    }

    #[test]
    fn test_exclusive_blocks_other_readers() {
        let table = short_table();
        table.acquire_exclusive(1, &pid(1)).unwrap();
        assert!(matches!(
            table.acquire_shared(2, &pid(1)),
            Err(DbError::TransactionAborted)
        ));
        //  the holder itself can still read and re-acquire
        table.acquire_shared(1, &pid(1)).unwrap();
        table.acquire_exclusive(1, &pid(1)).unwrap();
    }

    #[test]
    fn test_upgrade_when_sole_reader() {
        let table = short_table();
        table.acquire_shared(1, &pid(1)).unwrap();
        table.acquire_exclusive(1, &pid(1)).unwrap();
        assert!(table.holds_exclusive(1, &pid(1)));
    }

    #[test]
    fn test_upgrade_blocks_while_shared() {
        let table = short_table();
        table.acquire_shared(1, &pid(1)).unwrap();
        table.acquire_shared(2, &pid(1)).unwrap();
        assert!(matches!(
            table.acquire_exclusive(1, &pid(1)),
            Err(DbError::TransactionAborted)
        ));
    }

    #[test]
    fn test_release_wakes_waiters() {
        let table = Arc::new(LockTable::new(Duration::from_secs(5)));
        table.acquire_exclusive(1, &pid(1)).unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || table.acquire_exclusive(2, &pid(1)))
        };
        std::thread::sleep(Duration::from_millis(20));
        table.release_all(1);
        waiter.join().unwrap().unwrap();
        assert!(table.holds_exclusive(2, &pid(1)));
    }

    #[test]
    fn test_release_all_frees_every_page() {
        let table = short_table();
        table.acquire_exclusive(1, &pid(1)).unwrap();
        table.acquire_shared(1, &pid(2)).unwrap();
        table.release_all(1);
        table.acquire_exclusive(2, &pid(1)).unwrap();
        table.acquire_exclusive(2, &pid(2)).unwrap();
    }

    #[test]
    fn test_lock_set_caches_held_locks() {
        let table = short_table();
        let locks = LockSet::new(1);
        locks.slock(&table, &pid(1)).unwrap();
        assert_eq!(locks.holds(&pid(1)), Some(LockType::Shared));
        locks.xlock(&table, &pid(1)).unwrap();
        assert_eq!(locks.holds(&pid(1)), Some(LockType::Exclusive));
        locks.release_all(&table);
        assert_eq!(locks.holds(&pid(1)), None);
    }
}
