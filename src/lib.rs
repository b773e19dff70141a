pub mod benchmark_framework;
pub mod btree;
pub mod buffer;
pub mod bulk;
pub mod check;
pub mod concurrency;
pub mod error;
pub mod file;
pub mod page;
pub mod test_utils;
pub mod transaction;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::btree::BTreeFile;
use crate::buffer::BufferPool;
use crate::error::Result;
use crate::file::IndexFile;
use crate::transaction::Transaction;
use crate::types::Layout;

pub use crate::error::DbError;

/// A directory of index files sharing one buffer pool and lock table.
pub struct Database {
    dir: PathBuf,
    page_size: usize,
    pool: Arc<BufferPool>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(
        dir: P,
        page_size: usize,
        pool_capacity: usize,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            page_size,
            pool: Arc::new(BufferPool::new(pool_capacity, lock_timeout)),
        }
    }

    /// A database rooted in a throwaway directory under /tmp. The
    /// returned [`test_utils::TestDir`] removes it on drop. Used by both
    /// tests and benchmarks, so it is not test-gated.
    pub fn new_for_test(
        page_size: usize,
        pool_capacity: usize,
        lock_timeout_ms: u64,
    ) -> (Self, test_utils::TestDir) {
        use std::time::{SystemTime, UNIX_EPOCH};

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let thread_id = std::thread::current().id();
        let test_dir = test_utils::TestDir::new(format!("/tmp/test_db_{}_{:?}", timestamp, thread_id));
        let db = Self::new(
            &test_dir,
            page_size,
            pool_capacity,
            Duration::from_millis(lock_timeout_ms),
        );
        (db, test_dir)
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Open (or create) the index named `name`, register its file with
    /// the buffer pool, and hand back the tree.
    pub fn open_index(&self, name: &str, layout: Layout, key_field: usize) -> Result<BTreeFile> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{name}.idx"));
        let file = Arc::new(IndexFile::open(&path, layout, key_field, self.page_size)?);
        self.pool.register_file(Arc::clone(&file));
        Ok(BTreeFile::new(file))
    }

    pub fn new_tx(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.pool))
    }
}
