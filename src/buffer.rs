use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::concurrency::{LockSet, LockTable, TransactionID};
use crate::error::{DbError, Result};
use crate::file::IndexFile;
use crate::page::{
    BTreePage, BTreePageId, HeaderPage, InternalPage, LeafPage, PageCategory, RootPtrPage,
};

/// How a transaction intends to use a page. Read-write access takes an
/// exclusive lock on fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

/// The shared page store. Every transaction reaches pages through here,
/// and two fetches of the same page id return the same `Arc`, so all
/// readers and the writer of a page observe one in-memory object.
///
/// Dirty pages are pinned: eviction only ever drops clean pages, and a
/// transaction's dirty pages are written back in one batch at commit
/// (or dropped wholesale at abort).
pub struct BufferPool {
    capacity: usize,
    lock_table: LockTable,
    files: RwLock<HashMap<u32, Arc<IndexFile>>>,
    cache: Mutex<HashMap<BTreePageId, Arc<Mutex<BTreePage>>>>,
    dirty: Mutex<HashMap<BTreePageId, TransactionID>>,
}

impl BufferPool {
    pub fn new(capacity: usize, lock_timeout: Duration) -> Self {
        Self {
            capacity,
            lock_table: LockTable::new(lock_timeout),
            files: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    /// Register an index file so its pages can be fetched by table id.
    pub fn register_file(&self, file: Arc<IndexFile>) -> u32 {
        let table_id = file.table_id();
        self.files.write().unwrap().insert(table_id, file);
        table_id
    }

    pub fn get_file(&self, table_id: u32) -> Result<Arc<IndexFile>> {
        self.files
            .read()
            .unwrap()
            .get(&table_id)
            .cloned()
            .ok_or_else(|| DbError::invalid(format!("no index file registered for table {table_id}")))
    }

    /// Fetch a page, acquiring the lock the permission calls for. The
    /// returned `Arc` is shared with every other transaction holding the
    /// page.
    pub fn get_page(
        &self,
        locks: &LockSet,
        pid: &BTreePageId,
        perm: Permission,
    ) -> Result<Arc<Mutex<BTreePage>>> {
        match perm {
            Permission::ReadOnly => locks.slock(&self.lock_table, pid)?,
            Permission::ReadWrite => locks.xlock(&self.lock_table, pid)?,
        }
        let mut cache = self.cache.lock().unwrap();
        if let Some(page) = cache.get(pid) {
            return Ok(Arc::clone(page));
        }
        if cache.len() >= self.capacity {
            self.evict_one(&mut cache)?;
        }
        let file = self.get_file(pid.table_id)?;
        let page = Arc::new(Mutex::new(file.read_page(pid)?));
        cache.insert(*pid, Arc::clone(&page));
        Ok(page)
    }

    fn evict_one(&self, cache: &mut HashMap<BTreePageId, Arc<Mutex<BTreePage>>>) -> Result<()> {
        let dirty = self.dirty.lock().unwrap();
        let victim = cache.keys().find(|pid| !dirty.contains_key(pid)).copied();
        match victim {
            Some(pid) => {
                debug!(page = %pid, "evicting clean page");
                cache.remove(&pid);
                Ok(())
            }
            None => Err(DbError::invalid(
                "buffer pool is full and every page is dirty",
            )),
        }
    }

    /// Record that `tid` modified `pid`. The page stays cached until the
    /// transaction resolves.
    pub fn mark_dirty(&self, tid: TransactionID, pid: &BTreePageId) {
        self.dirty.lock().unwrap().insert(*pid, tid);
    }

    /// Replace whatever is cached (or on disk) for `pid`'s slot with a
    /// fresh empty page of `pid`'s category. Used when a freed page is
    /// reused under a new category: any stale cache entry for the slot is
    /// dropped first so no old-category object survives.
    pub fn wipe_page(
        &self,
        tid: TransactionID,
        locks: &LockSet,
        pid: &BTreePageId,
    ) -> Result<Arc<Mutex<BTreePage>>> {
        locks.xlock(&self.lock_table, pid)?;
        self.discard_page(pid);
        let file = self.get_file(pid.table_id)?;
        let fresh = match pid.category {
            PageCategory::Leaf => BTreePage::Leaf(LeafPage::new_empty(
                *pid,
                file.layout().clone(),
                file.key_field(),
                file.page_size(),
            )),
            PageCategory::Internal => BTreePage::Internal(InternalPage::new_empty(
                *pid,
                file.key_type(),
                file.page_size(),
            )),
            PageCategory::Header => {
                BTreePage::Header(HeaderPage::new_empty(*pid, file.page_size()))
            }
            PageCategory::RootPtr => BTreePage::RootPtr(RootPtrPage::new_empty(*pid)),
        };
        let page = Arc::new(Mutex::new(fresh));
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= self.capacity {
            self.evict_one(&mut cache)?;
        }
        cache.insert(*pid, Arc::clone(&page));
        drop(cache);
        self.mark_dirty(tid, pid);
        Ok(page)
    }

    /// Drop every cached object occupying `pid`'s file slot, whatever
    /// category it was cached under.
    pub fn discard_page(&self, pid: &BTreePageId) {
        let mut cache = self.cache.lock().unwrap();
        cache.retain(|cached, _| {
            !(cached.table_id == pid.table_id && cached.page_no == pid.page_no)
        });
        let mut dirty = self.dirty.lock().unwrap();
        dirty.retain(|cached, _| {
            !(cached.table_id == pid.table_id && cached.page_no == pid.page_no)
        });
    }

    /// Write every page `tid` dirtied back to its file. Called on commit.
    pub fn flush_transaction(&self, tid: TransactionID) -> Result<()> {
        let pids: Vec<BTreePageId> = {
            let dirty = self.dirty.lock().unwrap();
            dirty
                .iter()
                .filter(|(_, &owner)| owner == tid)
                .map(|(pid, _)| *pid)
                .collect()
        };
        for pid in &pids {
            let page = {
                let cache = self.cache.lock().unwrap();
                cache.get(pid).cloned()
            };
            if let Some(page) = page {
                let file = self.get_file(pid.table_id)?;
                let guard = page.lock().unwrap();
                file.write_page(&guard)?;
                debug!(tid, page = %pid, "flushed dirty page");
            }
        }
        let mut dirty = self.dirty.lock().unwrap();
        dirty.retain(|_, &mut owner| owner != tid);
        Ok(())
    }

    /// Throw away every page `tid` dirtied, so the next fetch re-reads
    /// the on-disk copy. Called on abort.
    pub fn discard_transaction(&self, tid: TransactionID) {
        let mut dirty = self.dirty.lock().unwrap();
        let pids: Vec<BTreePageId> = dirty
            .iter()
            .filter(|(_, &owner)| owner == tid)
            .map(|(pid, _)| *pid)
            .collect();
        dirty.retain(|_, &mut owner| owner != tid);
        drop(dirty);
        let mut cache = self.cache.lock().unwrap();
        for pid in pids {
            debug!(tid, page = %pid, "discarding dirty page on abort");
            cache.remove(&pid);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_pages(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[cfg(test)]
mod buffer_pool_tests {
    use super::*;
    use crate::test_utils::{generate_filename, TestDir};
    use crate::types::{FieldType, Layout, Tuple, Value};

    const PAGE_SIZE: usize = 64;

    fn test_layout() -> Layout {
        Layout::new(vec![FieldType::Int, FieldType::Int])
    }

    fn setup(dir: &TestDir, capacity: usize) -> (BufferPool, u32) {
        let pool = BufferPool::new(capacity, Duration::from_millis(100));
        let path = dir.as_ref().join(generate_filename());
        let file = IndexFile::open(&path, test_layout(), 0, PAGE_SIZE).unwrap();
        file.allocate_page().unwrap();
        file.allocate_page().unwrap();
        let table_id = pool.register_file(Arc::new(file));
        (pool, table_id)
    }

    fn tuple(key: i32) -> Tuple {
        Tuple::new(vec![Value::Int(key), Value::Int(key)])
    }

    #[test]
    fn test_same_page_id_returns_same_object() {
        let dir = TestDir::new("/tmp/buffer_pool_identity");
        let (pool, table_id) = setup(&dir, 8);
        let pid = BTreePageId::new(table_id, 1, PageCategory::Leaf);

        let locks_a = LockSet::new(1);
        let locks_b = LockSet::new(2);
        let a = pool.get_page(&locks_a, &pid, Permission::ReadOnly).unwrap();
        let b = pool.get_page(&locks_b, &pid, Permission::ReadOnly).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_flush_makes_changes_durable() {
        let dir = TestDir::new("/tmp/buffer_pool_flush");
        let (pool, table_id) = setup(&dir, 8);
        let pid = BTreePageId::new(table_id, 1, PageCategory::Leaf);

        let locks = LockSet::new(1);
        let page = pool.get_page(&locks, &pid, Permission::ReadWrite).unwrap();
        page.lock()
            .unwrap()
            .as_leaf_mut()
            .unwrap()
            .insert_tuple(tuple(7))
            .unwrap();
        pool.mark_dirty(1, &pid);
        pool.flush_transaction(1).unwrap();

        let on_disk = pool.get_file(table_id).unwrap().read_page(&pid).unwrap();
        assert_eq!(on_disk.as_leaf().unwrap().used_slots(), 1);
    }

    #[test]
    fn test_discard_transaction_reverts_changes() {
        let dir = TestDir::new("/tmp/buffer_pool_discard");
        let (pool, table_id) = setup(&dir, 8);
        let pid = BTreePageId::new(table_id, 1, PageCategory::Leaf);

        let locks = LockSet::new(1);
        let page = pool.get_page(&locks, &pid, Permission::ReadWrite).unwrap();
        page.lock()
            .unwrap()
            .as_leaf_mut()
            .unwrap()
            .insert_tuple(tuple(7))
            .unwrap();
        pool.mark_dirty(1, &pid);
        pool.discard_transaction(1);
        locks.release_all(pool.lock_table());

        let locks = LockSet::new(2);
        let page = pool.get_page(&locks, &pid, Permission::ReadOnly).unwrap();
        assert_eq!(page.lock().unwrap().as_leaf().unwrap().used_slots(), 0);
    }

    #[test]
    fn test_clean_pages_are_evicted_when_full() {
        let dir = TestDir::new("/tmp/buffer_pool_evict");
        let (pool, table_id) = setup(&dir, 1);
        let locks = LockSet::new(1);

        let first = BTreePageId::new(table_id, 1, PageCategory::Leaf);
        let second = BTreePageId::new(table_id, 2, PageCategory::Leaf);
        pool.get_page(&locks, &first, Permission::ReadOnly).unwrap();
        pool.get_page(&locks, &second, Permission::ReadOnly).unwrap();
        assert_eq!(pool.cached_pages(), 1);
    }

    #[test]
    fn test_full_pool_of_dirty_pages_errors() {
        let dir = TestDir::new("/tmp/buffer_pool_full");
        let (pool, table_id) = setup(&dir, 1);
        let locks = LockSet::new(1);

        let first = BTreePageId::new(table_id, 1, PageCategory::Leaf);
        pool.get_page(&locks, &first, Permission::ReadWrite).unwrap();
        pool.mark_dirty(1, &first);

        let second = BTreePageId::new(table_id, 2, PageCategory::Leaf);
        assert!(pool.get_page(&locks, &second, Permission::ReadOnly).is_err());
    }

    #[test]
    fn test_wipe_page_discards_stale_category() {
        let dir = TestDir::new("/tmp/buffer_pool_wipe");
        let (pool, table_id) = setup(&dir, 8);
        let locks = LockSet::new(1);

        let as_leaf = BTreePageId::new(table_id, 1, PageCategory::Leaf);
        let page = pool.get_page(&locks, &as_leaf, Permission::ReadWrite).unwrap();
        page.lock()
            .unwrap()
            .as_leaf_mut()
            .unwrap()
            .insert_tuple(tuple(7))
            .unwrap();
        pool.mark_dirty(1, &as_leaf);

        //  reuse the slot as a header page; the leaf object must not survive
        let as_header = BTreePageId::new(table_id, 1, PageCategory::Header);
        let page = pool.wipe_page(1, &locks, &as_header).unwrap();
        assert!(page.lock().unwrap().as_header().is_ok());
        assert_eq!(pool.cached_pages(), 1);

        let stale = pool.get_page(&locks, &as_leaf, Permission::ReadOnly).unwrap();
        assert_eq!(stale.lock().unwrap().as_leaf().unwrap().used_slots(), 0);
    }
}
