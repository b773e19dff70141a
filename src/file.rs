use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{DbError, Result};
use crate::page::{
    BTreePage, BTreePageId, HeaderPage, InternalPage, LeafPage, PageCategory, RootPtrPage,
    ROOT_PTR_PAGE_SIZE,
};
use crate::types::{FieldType, Layout};

/// One index, one file. The root pointer page occupies the first
/// [`ROOT_PTR_PAGE_SIZE`] bytes; data page `n` (numbered from 1) starts at
/// `ROOT_PTR_PAGE_SIZE + (n - 1) * page_size`.
///
/// Reads past the end of the file return zeroed pages, so a fresh file
/// decodes as an empty tree without any explicit initialization.
pub struct IndexFile {
    path: PathBuf,
    table_id: u32,
    page_size: usize,
    layout: Layout,
    key_field: usize,
    file: Mutex<File>,
}

impl IndexFile {
    /// Open (or create) the index file at `path`. The table id is derived
    /// from the canonical path, so two opens of the same file agree on it.
    pub fn open(path: &Path, layout: Layout, key_field: usize, page_size: usize) -> Result<Self> {
        if key_field >= layout.fields().len() {
            return Err(DbError::invalid(format!(
                "key field {key_field} is out of range for a {}-field layout",
                layout.fields().len()
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let canonical = path.canonicalize()?;
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        let table_id = hasher.finish() as u32;
        debug!(path = %canonical.display(), table_id, "opened index file");
        Ok(Self {
            path: canonical,
            table_id,
            page_size,
            layout,
            key_field,
            file: Mutex::new(file),
        })
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn key_field(&self) -> usize {
        self.key_field
    }

    pub fn key_type(&self) -> FieldType {
        self.layout.field_type(self.key_field)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn page_offset(&self, page_no: usize) -> u64 {
        debug_assert!(page_no >= 1);
        (ROOT_PTR_PAGE_SIZE + (page_no - 1) * self.page_size) as u64
    }

    /// The number of data pages the file currently holds (excluding the
    /// root pointer page).
    pub fn num_pages(&self) -> Result<usize> {
        let file = self.file.lock().unwrap();
        let len = file.metadata()?.len() as usize;
        if len <= ROOT_PTR_PAGE_SIZE {
            return Ok(0);
        }
        Ok((len - ROOT_PTR_PAGE_SIZE + self.page_size - 1) / self.page_size)
    }

    fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        //  reads past EOF come back zeroed; a fresh file is all empty pages
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    /// Read and decode the page identified by `pid`.
    pub fn read_page(&self, pid: &BTreePageId) -> Result<BTreePage> {
        if pid.table_id != self.table_id {
            return Err(DbError::invalid(format!(
                "page {pid} does not belong to table {}",
                self.table_id
            )));
        }
        match pid.category {
            PageCategory::RootPtr => {
                if pid.page_no != 0 {
                    return Err(DbError::invalid(format!(
                        "root pointer page must be page 0, got {}",
                        pid.page_no
                    )));
                }
                let mut buf = vec![0u8; ROOT_PTR_PAGE_SIZE];
                self.read_raw(0, &mut buf)?;
                Ok(BTreePage::RootPtr(RootPtrPage::from_bytes(*pid, &buf)?))
            }
            category => {
                if pid.page_no == 0 {
                    return Err(DbError::invalid(format!(
                        "data pages are numbered from 1, got {pid}"
                    )));
                }
                let mut buf = vec![0u8; self.page_size];
                self.read_raw(self.page_offset(pid.page_no), &mut buf)?;
                match category {
                    PageCategory::Leaf => Ok(BTreePage::Leaf(LeafPage::from_bytes(
                        *pid,
                        self.layout.clone(),
                        self.key_field,
                        self.page_size,
                        &buf,
                    )?)),
                    PageCategory::Internal => Ok(BTreePage::Internal(InternalPage::from_bytes(
                        *pid,
                        self.key_type(),
                        self.page_size,
                        &buf,
                    )?)),
                    PageCategory::Header => Ok(BTreePage::Header(HeaderPage::from_bytes(
                        *pid,
                        self.page_size,
                        &buf,
                    )?)),
                    PageCategory::RootPtr => unreachable!(),
                }
            }
        }
    }

    /// Encode and write `page` back to its slot in the file.
    pub fn write_page(&self, page: &BTreePage) -> Result<()> {
        let pid = page.id();
        if pid.table_id != self.table_id {
            return Err(DbError::invalid(format!(
                "page {pid} does not belong to table {}",
                self.table_id
            )));
        }
        let bytes = page.to_bytes()?;
        let offset = match pid.category {
            PageCategory::RootPtr => 0,
            _ => self.page_offset(pid.page_no),
        };
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    /// Grow the file by one blank data page and return its page number.
    pub fn allocate_page(&self) -> Result<usize> {
        let page_no = self.num_pages()? + 1;
        let offset = self.page_offset(page_no);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&vec![0u8; self.page_size])?;
        file.flush()?;
        debug!(table_id = self.table_id, page_no, "allocated page");
        Ok(page_no)
    }
}

#[cfg(test)]
mod index_file_tests {
    use super::*;
    use crate::test_utils::{generate_filename, TestDir};
    use crate::types::{Tuple, Value};

    const PAGE_SIZE: usize = 64;

    fn test_layout() -> Layout {
        Layout::new(vec![FieldType::Int, FieldType::Int])
    }

    fn open_test_file(dir: &TestDir) -> IndexFile {
        let path = dir.as_ref().join(generate_filename());
        IndexFile::open(&path, test_layout(), 0, PAGE_SIZE).unwrap()
    }

    #[test]
    fn test_fresh_file_reads_as_empty() {
        let dir = TestDir::new("/tmp/index_file_empty");
        let file = open_test_file(&dir);
        assert_eq!(file.num_pages().unwrap(), 0);

        let root_ptr_pid = BTreePageId::new(file.table_id(), 0, PageCategory::RootPtr);
        let page = file.read_page(&root_ptr_pid).unwrap();
        assert!(page.as_root_ptr().unwrap().root_id().is_none());
    }

    #[test]
    fn test_write_and_read_back_a_leaf() {
        let dir = TestDir::new("/tmp/index_file_leaf");
        let file = open_test_file(&dir);
        let page_no = file.allocate_page().unwrap();
        assert_eq!(page_no, 1);
        assert_eq!(file.num_pages().unwrap(), 1);

        let pid = BTreePageId::new(file.table_id(), page_no, PageCategory::Leaf);
        let mut leaf = LeafPage::new_empty(pid, test_layout(), 0, PAGE_SIZE);
        leaf.insert_tuple(Tuple::new(vec![Value::Int(42), Value::Int(420)]))
            .unwrap();
        file.write_page(&BTreePage::Leaf(leaf)).unwrap();

        let read_back = file.read_page(&pid).unwrap();
        let leaf = read_back.as_leaf().unwrap();
        assert_eq!(leaf.used_slots(), 1);
        assert_eq!(leaf.iter().next().unwrap().value(0), &Value::Int(42));
    }

    #[test]
    fn test_read_past_eof_is_zeroed() {
        let dir = TestDir::new("/tmp/index_file_eof");
        let file = open_test_file(&dir);
        let pid = BTreePageId::new(file.table_id(), 7, PageCategory::Leaf);
        let page = file.read_page(&pid).unwrap();
        assert_eq!(page.as_leaf().unwrap().used_slots(), 0);
    }

    #[test]
    fn test_table_id_is_stable_across_opens() {
        let dir = TestDir::new("/tmp/index_file_table_id");
        let path = dir.as_ref().join(generate_filename());
        let first = IndexFile::open(&path, test_layout(), 0, PAGE_SIZE).unwrap();
        let second = IndexFile::open(&path, test_layout(), 0, PAGE_SIZE).unwrap();
        assert_eq!(first.table_id(), second.table_id());
    }

    #[test]
    fn test_rejects_foreign_page_ids() {
        let dir = TestDir::new("/tmp/index_file_foreign");
        let file = open_test_file(&dir);
        let foreign = BTreePageId::new(file.table_id().wrapping_add(1), 1, PageCategory::Leaf);
        assert!(file.read_page(&foreign).is_err());
    }
}
