use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::buffer::{BufferPool, Permission};
use crate::concurrency::{LockSet, TransactionID};
use crate::error::Result;
use crate::page::{BTreePage, BTreePageId};

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// A transaction: a lock set, a transaction id, and access to the shared
/// buffer pool. Locks are two-phase and held until commit or abort.
///
/// Commit flushes the transaction's dirty pages and releases its locks;
/// abort drops the dirty pages so the on-disk versions win. Dropping an
/// unresolved transaction aborts it.
pub struct Transaction {
    tid: TransactionID,
    pool: Arc<BufferPool>,
    locks: LockSet,
    resolved: bool,
}

impl Transaction {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
        debug!(tid, "transaction started");
        Self {
            tid,
            locks: LockSet::new(tid),
            pool,
            resolved: false,
        }
    }

    pub fn id(&self) -> TransactionID {
        self.tid
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn lock_set(&self) -> &LockSet {
        &self.locks
    }

    /// Fetch a page through the buffer pool with the given permission.
    pub fn get_page(&self, pid: &BTreePageId, perm: Permission) -> Result<Arc<Mutex<BTreePage>>> {
        self.pool.get_page(&self.locks, pid, perm)
    }

    /// Record that this transaction modified `pid`.
    pub fn mark_dirty(&self, pid: &BTreePageId) {
        self.pool.mark_dirty(self.tid, pid);
    }

    /// Replace `pid`'s slot with a fresh empty page of `pid`'s category.
    pub fn wipe_page(&self, pid: &BTreePageId) -> Result<Arc<Mutex<BTreePage>>> {
        self.pool.wipe_page(self.tid, &self.locks, pid)
    }

    /// Flush this transaction's dirty pages and release its locks.
    pub fn commit(mut self) -> Result<()> {
        debug!(tid = self.tid, "commit");
        self.pool.flush_transaction(self.tid)?;
        self.locks.release_all(self.pool.lock_table());
        self.resolved = true;
        Ok(())
    }

    /// Throw away this transaction's changes and release its locks.
    pub fn abort(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        debug!(tid = self.tid, "abort");
        self.pool.discard_transaction(self.tid);
        self.locks.release_all(self.pool.lock_table());
        self.resolved = true;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.resolved {
            self.abort_inner();
        }
    }
}

#[cfg(test)]
mod transaction_tests {
    use super::*;
    use crate::file::IndexFile;
    use crate::page::PageCategory;
    use crate::test_utils::{generate_filename, TestDir};
    use crate::types::{FieldType, Layout, Tuple, Value};
    use std::time::Duration;

    const PAGE_SIZE: usize = 64;

    fn setup(dir: &TestDir) -> (Arc<BufferPool>, u32) {
        let pool = Arc::new(BufferPool::new(16, Duration::from_millis(100)));
        let path = dir.as_ref().join(generate_filename());
        let file = IndexFile::open(
            &path,
            Layout::new(vec![FieldType::Int, FieldType::Int]),
            0,
            PAGE_SIZE,
        )
        .unwrap();
        file.allocate_page().unwrap();
        let table_id = pool.register_file(Arc::new(file));
        (pool, table_id)
    }

    fn insert_one(tx: &Transaction, pid: &BTreePageId, key: i32) {
        let page = tx.get_page(pid, Permission::ReadWrite).unwrap();
        page.lock()
            .unwrap()
            .as_leaf_mut()
            .unwrap()
            .insert_tuple(Tuple::new(vec![Value::Int(key), Value::Int(key)]))
            .unwrap();
        tx.mark_dirty(pid);
    }

    fn count_tuples(tx: &Transaction, pid: &BTreePageId) -> usize {
        let page = tx.get_page(pid, Permission::ReadOnly).unwrap();
        let guard = page.lock().unwrap();
        guard.as_leaf().unwrap().used_slots()
    }

    #[test]
    fn test_commit_is_durable() {
        let dir = TestDir::new("/tmp/tx_commit");
        let (pool, table_id) = setup(&dir);
        let pid = BTreePageId::new(table_id, 1, PageCategory::Leaf);

        let tx = Transaction::new(Arc::clone(&pool));
        insert_one(&tx, &pid, 7);
        tx.commit().unwrap();

        let tx = Transaction::new(pool);
        assert_eq!(count_tuples(&tx, &pid), 1);
        tx.commit().unwrap();
    }

    #[test]
    fn test_abort_reverts() {
        let dir = TestDir::new("/tmp/tx_abort");
        let (pool, table_id) = setup(&dir);
        let pid = BTreePageId::new(table_id, 1, PageCategory::Leaf);

        let tx = Transaction::new(Arc::clone(&pool));
        insert_one(&tx, &pid, 7);
        tx.abort();

        let tx = Transaction::new(pool);
        assert_eq!(count_tuples(&tx, &pid), 0);
        tx.commit().unwrap();
    }

    #[test]
    fn test_drop_aborts_and_releases_locks() {
        let dir = TestDir::new("/tmp/tx_drop");
        let (pool, table_id) = setup(&dir);
        let pid = BTreePageId::new(table_id, 1, PageCategory::Leaf);

        {
            let tx = Transaction::new(Arc::clone(&pool));
            insert_one(&tx, &pid, 7);
            //  dropped without commit
        }

        let tx = Transaction::new(pool);
        assert_eq!(count_tuples(&tx, &pid), 0);
        tx.commit().unwrap();
    }

    #[test]
    fn test_writer_blocks_second_writer() {
        let dir = TestDir::new("/tmp/tx_conflict");
        let (pool, table_id) = setup(&dir);
        let pid = BTreePageId::new(table_id, 1, PageCategory::Leaf);

        let writer = Transaction::new(Arc::clone(&pool));
        writer.get_page(&pid, Permission::ReadWrite).unwrap();

        let rival = Transaction::new(Arc::clone(&pool));
        assert!(rival.get_page(&pid, Permission::ReadWrite).is_err());
        rival.abort();
        writer.commit().unwrap();
    }
}
