use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::buffer::Permission;
use crate::error::{DbError, Result};
use crate::file::IndexFile;
use crate::page::{header_capacity, BTreePage, BTreePageId, Entry, PageCategory};
use crate::transaction::Transaction;
use crate::types::{Layout, Tuple, Value};

/// The pages one tree operation has fetched for writing. Structural
/// operations recurse (split parents, cascade merges); threading the
/// working set through keeps every participant looking at the same
/// in-memory objects without re-locking.
pub type WorkingSet = HashMap<BTreePageId, Arc<Mutex<BTreePage>>>;

/// A page is poor when more than this many of its slots are empty. The
/// minimum load is floor((capacity - 1) / 2): splitting a full internal
/// page pushes its middle key up, leaving exactly that many entries on
/// the lower half.
pub(crate) fn max_empty_slots(capacity: usize) -> usize {
    capacity - (capacity - 1) / 2
}

/// A B+ tree index stored in a single file.
///
/// Leaves hold the records in key order and are chained into a doubly
/// linked list; internal pages route by key; a header page chain tracks
/// freed pages for reuse. All page access goes through the transaction's
/// buffer pool, so the locking protocol is: shared locks to descend,
/// exclusive locks on every page an operation mutates.
pub struct BTreeFile {
    file: Arc<IndexFile>,
}

impl BTreeFile {
    pub fn new(file: Arc<IndexFile>) -> Self {
        Self { file }
    }

    pub fn table_id(&self) -> u32 {
        self.file.table_id()
    }

    pub fn layout(&self) -> &Layout {
        self.file.layout()
    }

    pub fn key_field(&self) -> usize {
        self.file.key_field()
    }

    pub fn num_pages(&self) -> Result<usize> {
        self.file.num_pages()
    }

    fn pid(&self, page_no: usize, category: PageCategory) -> BTreePageId {
        BTreePageId::new(self.table_id(), page_no, category)
    }

    fn root_ptr_pid(&self) -> BTreePageId {
        self.pid(0, PageCategory::RootPtr)
    }

    fn slots_per_header(&self) -> usize {
        header_capacity(self.file.page_size())
    }

    /// Fetch a page, preferring the operation's working set so every
    /// fetch of a page within one operation yields the same object.
    fn get_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        pid: &BTreePageId,
        perm: Permission,
    ) -> Result<Arc<Mutex<BTreePage>>> {
        if let Some(page) = ws.get(pid) {
            return Ok(Arc::clone(page));
        }
        let page = tx.get_page(pid, perm)?;
        if perm == Permission::ReadWrite {
            ws.insert(*pid, Arc::clone(&page));
        }
        Ok(page)
    }

    fn root_id(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        perm: Permission,
    ) -> Result<Option<BTreePageId>> {
        let arc = self.get_page(tx, ws, &self.root_ptr_pid(), perm)?;
        let guard = arc.lock().unwrap();
        guard.as_root_ptr().map(|p| p.root_id())
    }

    /// Descend from `pid` to the leaf where `key` belongs. With no key,
    /// descend to the leftmost leaf. Internal pages are read with shared
    /// locks; only the destination leaf gets `perm`.
    ///
    /// Routing goes left on an equal key, so a search lands on the first
    /// leaf that can hold a duplicate of it.
    fn find_leaf_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        pid: BTreePageId,
        key: Option<&Value>,
        perm: Permission,
    ) -> Result<BTreePageId> {
        if pid.category == PageCategory::Leaf {
            self.get_page(tx, ws, &pid, perm)?;
            return Ok(pid);
        }
        let next = {
            let arc = self.get_page(tx, ws, &pid, Permission::ReadOnly)?;
            let guard = arc.lock().unwrap();
            let internal = guard.as_internal()?;
            match key {
                None => internal.first_child_id()?,
                Some(key) => {
                    let mut next = internal.last_child_id()?;
                    for entry in internal.iter() {
                        if entry.key() >= key {
                            next = entry.left_child();
                            break;
                        }
                    }
                    next
                }
            }
        };
        self.find_leaf_page(tx, ws, next, key, perm)
    }

    /// Insert a tuple, splitting pages (and growing the tree by a level)
    /// as needed. The change is buffered in the transaction until commit.
    pub fn insert_tuple(&self, tx: &Transaction, mut tuple: Tuple) -> Result<()> {
        self.layout().check_tuple(&tuple)?;
        tuple.set_record_id(None);
        let key = tuple.value(self.key_field()).clone();
        let mut ws = WorkingSet::new();

        let root_id = match self.root_id(tx, &mut ws, Permission::ReadWrite)? {
            Some(root_id) => root_id,
            None => {
                //  first insert ever: the root is a single leaf
                let (pid, _) = self.get_empty_page(tx, &mut ws, PageCategory::Leaf)?;
                let arc = self.get_page(tx, &mut ws, &self.root_ptr_pid(), Permission::ReadWrite)?;
                arc.lock().unwrap().as_root_ptr_mut()?.set_root_id(&pid)?;
                tx.mark_dirty(&self.root_ptr_pid());
                debug!(table_id = self.table_id(), root = pid.page_no, "created root leaf");
                pid
            }
        };

        let leaf_pid =
            self.find_leaf_page(tx, &mut ws, root_id, Some(&key), Permission::ReadWrite)?;
        let leaf_pid = {
            let arc = self.get_page(tx, &mut ws, &leaf_pid, Permission::ReadWrite)?;
            let full = arc.lock().unwrap().as_leaf()?.empty_slots() == 0;
            if full {
                self.split_leaf_page(tx, &mut ws, leaf_pid, &key)?
            } else {
                leaf_pid
            }
        };

        let arc = self.get_page(tx, &mut ws, &leaf_pid, Permission::ReadWrite)?;
        arc.lock().unwrap().as_leaf_mut()?.insert_tuple(tuple)?;
        tx.mark_dirty(&leaf_pid);
        Ok(())
    }

    /// Split a full leaf: the upper half of its records moves to a fresh
    /// right sibling, and the new page's first key is copied up into the
    /// parent. Returns the page the pending `key` should be inserted into.
    fn split_leaf_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        leaf_pid: BTreePageId,
        key: &Value,
    ) -> Result<BTreePageId> {
        let old_arc = self.get_page(tx, ws, &leaf_pid, Permission::ReadWrite)?;
        let (new_pid, new_arc) = self.get_empty_page(tx, ws, PageCategory::Leaf)?;

        let (separator, old_right, parent_pid) = {
            let mut old_guard = old_arc.lock().unwrap();
            let old_leaf = old_guard.as_leaf_mut()?;
            let mut new_guard = new_arc.lock().unwrap();
            let new_leaf = new_guard.as_leaf_mut()?;

            let slots: Vec<usize> = old_leaf.occupied_slots().collect();
            let move_count = slots.len() / 2;
            for &slot in &slots[slots.len() - move_count..] {
                let mut tuple = old_leaf.tuple_at(slot).unwrap().clone();
                old_leaf.remove_slot(slot);
                tuple.set_record_id(None);
                new_leaf.insert_tuple(tuple)?;
            }
            let separator = new_leaf.first_key()?;

            let old_right = old_leaf.right_sibling_id();
            new_leaf.set_right_sibling_id(old_right.as_ref())?;
            new_leaf.set_left_sibling_id(Some(&leaf_pid))?;
            old_leaf.set_right_sibling_id(Some(&new_pid))?;
            (separator, old_right, old_leaf.parent_id())
        };
        tx.mark_dirty(&leaf_pid);
        debug!(
            old = leaf_pid.page_no,
            new = new_pid.page_no,
            separator = %separator,
            "split leaf page"
        );

        if let Some(right_pid) = old_right {
            let arc = self.get_page(tx, ws, &right_pid, Permission::ReadWrite)?;
            arc.lock()
                .unwrap()
                .as_leaf_mut()?
                .set_left_sibling_id(Some(&new_pid))?;
            tx.mark_dirty(&right_pid);
        }

        let parent_pid = self.get_parent_with_empty_slots(tx, ws, parent_pid, &leaf_pid)?;
        let parent_arc = self.get_page(tx, ws, &parent_pid, Permission::ReadWrite)?;
        parent_arc
            .lock()
            .unwrap()
            .as_internal_mut()?
            .insert_entry(Entry::new(separator.clone(), leaf_pid, new_pid))?;
        tx.mark_dirty(&parent_pid);

        for pid in [&leaf_pid, &new_pid] {
            let arc = self.get_page(tx, ws, pid, Permission::ReadWrite)?;
            arc.lock().unwrap().set_parent_id(&parent_pid)?;
        }

        if key >= &separator {
            Ok(new_pid)
        } else {
            Ok(leaf_pid)
        }
    }

    /// Split a full internal page: the upper half of its entries moves to
    /// a fresh page and the middle key is pushed up into the parent,
    /// disappearing from this level. Returns both halves, old then new.
    fn split_internal_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        page_pid: BTreePageId,
    ) -> Result<(BTreePageId, BTreePageId)> {
        let old_arc = self.get_page(tx, ws, &page_pid, Permission::ReadWrite)?;
        let (new_pid, new_arc) = self.get_empty_page(tx, ws, PageCategory::Internal)?;

        let (middle, parent_pid) = {
            let mut old_guard = old_arc.lock().unwrap();
            let old_page = old_guard.as_internal_mut()?;
            let mut new_guard = new_arc.lock().unwrap();
            let new_page = new_guard.as_internal_mut()?;

            let entries: Vec<Entry> = old_page.iter().collect();
            let move_count = entries.len() / 2;
            //  move in reverse so each moved entry connects to the
            //  previous one through its shared child
            for entry in entries[entries.len() - move_count..].iter().rev() {
                old_page.delete_key_and_right_child(entry)?;
                new_page.insert_entry(Entry::new(
                    entry.key().clone(),
                    entry.left_child(),
                    entry.right_child(),
                ))?;
            }
            //  the middle entry leaves this level; its right child is
            //  already the new page's leftmost child
            let middle = entries[entries.len() - move_count - 1].clone();
            old_page.delete_key_and_right_child(&middle)?;
            (middle, old_page.parent_id())
        };
        tx.mark_dirty(&page_pid);
        debug!(
            old = page_pid.page_no,
            new = new_pid.page_no,
            middle = %middle.key(),
            "split internal page"
        );

        self.update_parent_pointers(tx, ws, &new_pid)?;

        let parent_pid = self.get_parent_with_empty_slots(tx, ws, parent_pid, &page_pid)?;
        let parent_arc = self.get_page(tx, ws, &parent_pid, Permission::ReadWrite)?;
        parent_arc
            .lock()
            .unwrap()
            .as_internal_mut()?
            .insert_entry(Entry::new(middle.key().clone(), page_pid, new_pid))?;
        tx.mark_dirty(&parent_pid);

        for pid in [&page_pid, &new_pid] {
            let arc = self.get_page(tx, ws, pid, Permission::ReadWrite)?;
            arc.lock().unwrap().set_parent_id(&parent_pid)?;
        }

        Ok((page_pid, new_pid))
    }

    /// Find (or make) a parent page with room for one more entry. The new
    /// entry joins the parent through its left child `child`, so when a
    /// full parent is split the returned half is the one that kept
    /// `child`; with duplicate keys the separator can tie with the
    /// pushed-up middle, and the tie can land either side of it. A
    /// root-pointer parent means the split page was the root: a new
    /// internal root is created, growing the tree by one level.
    fn get_parent_with_empty_slots(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        parent_pid: BTreePageId,
        child: &BTreePageId,
    ) -> Result<BTreePageId> {
        if parent_pid.category == PageCategory::RootPtr {
            let (new_root_pid, _) = self.get_empty_page(tx, ws, PageCategory::Internal)?;
            let arc = self.get_page(tx, ws, &self.root_ptr_pid(), Permission::ReadWrite)?;
            arc.lock()
                .unwrap()
                .as_root_ptr_mut()?
                .set_root_id(&new_root_pid)?;
            tx.mark_dirty(&self.root_ptr_pid());
            debug!(root = new_root_pid.page_no, "grew tree with new internal root");
            return Ok(new_root_pid);
        }
        let arc = self.get_page(tx, ws, &parent_pid, Permission::ReadWrite)?;
        let full = arc.lock().unwrap().as_internal()?.empty_slots() == 0;
        if !full {
            return Ok(parent_pid);
        }
        let (left_pid, right_pid) = self.split_internal_page(tx, ws, parent_pid)?;
        let left_holds_child = {
            let arc = self.get_page(tx, ws, &left_pid, Permission::ReadWrite)?;
            let guard = arc.lock().unwrap();
            guard.as_internal()?.children().contains(child)
        };
        Ok(if left_holds_child { left_pid } else { right_pid })
    }

    /// Point every child of `internal_pid` back at it. Children already
    /// pointing correctly are only read-locked.
    fn update_parent_pointers(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        internal_pid: &BTreePageId,
    ) -> Result<()> {
        let children: Vec<BTreePageId> = {
            let arc = self.get_page(tx, ws, internal_pid, Permission::ReadWrite)?;
            let guard = arc.lock().unwrap();
            guard.as_internal()?.children()
        };
        for child in children {
            let needs_update = {
                let arc = self.get_page(tx, ws, &child, Permission::ReadOnly)?;
                let guard = arc.lock().unwrap();
                guard.parent_id()? != *internal_pid
            };
            if needs_update {
                let arc = self.get_page(tx, ws, &child, Permission::ReadWrite)?;
                arc.lock().unwrap().set_parent_id(internal_pid)?;
                tx.mark_dirty(&child);
            }
        }
        Ok(())
    }

    /// Delete the stored record the tuple points at (its record id must
    /// be set, i.e. the tuple came out of this index). Pages that fall
    /// under half full are refilled from a sibling or merged away.
    pub fn delete_tuple(&self, tx: &Transaction, tuple: &Tuple) -> Result<()> {
        let rid = tuple
            .record_id()
            .ok_or_else(|| DbError::invalid("cannot delete a tuple with no record id"))?;
        if rid.page_id.table_id != self.table_id() || rid.page_id.category != PageCategory::Leaf {
            return Err(DbError::invalid(format!(
                "record id {} does not name a leaf of this index",
                rid.page_id
            )));
        }
        let mut ws = WorkingSet::new();
        let leaf_pid = rid.page_id;
        let arc = self.get_page(tx, &mut ws, &leaf_pid, Permission::ReadWrite)?;
        let underfull = {
            let mut guard = arc.lock().unwrap();
            let leaf = guard.as_leaf_mut()?;
            leaf.delete_tuple(&rid)?;
            leaf.empty_slots() > max_empty_slots(leaf.capacity())
        };
        tx.mark_dirty(&leaf_pid);
        if underfull {
            self.handle_underfull_page(tx, &mut ws, leaf_pid)?;
        }
        Ok(())
    }

    /// Refill an under-half-full page from a sibling, or merge it into
    /// one. The root is allowed to run underfull.
    fn handle_underfull_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        page_pid: BTreePageId,
    ) -> Result<()> {
        let parent_pid = {
            let arc = self.get_page(tx, ws, &page_pid, Permission::ReadWrite)?;
            let guard = arc.lock().unwrap();
            guard.parent_id()?
        };
        if parent_pid.category == PageCategory::RootPtr {
            return Ok(());
        }

        //  locate the parent entries either side of this page
        let (left_entry, right_entry) = {
            let arc = self.get_page(tx, ws, &parent_pid, Permission::ReadWrite)?;
            let guard = arc.lock().unwrap();
            let parent = guard.as_internal()?;
            let mut left = None;
            let mut right = None;
            for entry in parent.iter() {
                if entry.right_child() == page_pid {
                    left = Some(entry);
                } else if entry.left_child() == page_pid {
                    right = Some(entry);
                }
            }
            (left, right)
        };

        //  prefer the left sibling when both exist
        let (entry, sibling_pid, sibling_is_left) = if let Some(entry) = left_entry {
            let sibling = entry.left_child();
            (entry, sibling, true)
        } else if let Some(entry) = right_entry {
            let sibling = entry.right_child();
            (entry, sibling, false)
        } else {
            return Err(DbError::invalid(format!(
                "page {page_pid} is missing from its parent {parent_pid}"
            )));
        };

        let sibling_arc = self.get_page(tx, ws, &sibling_pid, Permission::ReadWrite)?;
        let (sibling_empty, capacity) = {
            let guard = sibling_arc.lock().unwrap();
            match &*guard {
                BTreePage::Leaf(p) => (p.empty_slots(), p.capacity()),
                BTreePage::Internal(p) => (p.empty_slots(), p.capacity()),
                other => {
                    return Err(DbError::invalid(format!(
                        "sibling {} is not a data page",
                        other.id()
                    )))
                }
            }
        };
        let sibling_can_spare = sibling_empty < max_empty_slots(capacity);

        match page_pid.category {
            PageCategory::Leaf => {
                if sibling_can_spare {
                    self.steal_from_leaf_page(
                        tx,
                        ws,
                        page_pid,
                        sibling_pid,
                        parent_pid,
                        entry,
                        sibling_is_left,
                    )
                } else if sibling_is_left {
                    self.merge_leaf_pages(tx, ws, sibling_pid, page_pid, parent_pid, entry)
                } else {
                    self.merge_leaf_pages(tx, ws, page_pid, sibling_pid, parent_pid, entry)
                }
            }
            PageCategory::Internal => {
                if sibling_can_spare && sibling_is_left {
                    self.steal_from_left_internal_page(
                        tx, ws, page_pid, sibling_pid, parent_pid, entry,
                    )
                } else if sibling_can_spare {
                    self.steal_from_right_internal_page(
                        tx, ws, page_pid, sibling_pid, parent_pid, entry,
                    )
                } else if sibling_is_left {
                    self.merge_internal_pages(tx, ws, sibling_pid, page_pid, parent_pid, entry)
                } else {
                    self.merge_internal_pages(tx, ws, page_pid, sibling_pid, parent_pid, entry)
                }
            }
            other => Err(DbError::invalid(format!(
                "page category {other} cannot be rebalanced"
            ))),
        }
    }

    /// Move records from a rich leaf sibling until the two pages are
    /// evenly loaded, then reset the parent separator to the right-hand
    /// page's first key.
    #[allow(clippy::too_many_arguments)]
    fn steal_from_leaf_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        page_pid: BTreePageId,
        sibling_pid: BTreePageId,
        parent_pid: BTreePageId,
        mut entry: Entry,
        sibling_is_left: bool,
    ) -> Result<()> {
        let page_arc = self.get_page(tx, ws, &page_pid, Permission::ReadWrite)?;
        let sibling_arc = self.get_page(tx, ws, &sibling_pid, Permission::ReadWrite)?;

        let separator = {
            let mut page_guard = page_arc.lock().unwrap();
            let page = page_guard.as_leaf_mut()?;
            let mut sibling_guard = sibling_arc.lock().unwrap();
            let sibling = sibling_guard.as_leaf_mut()?;

            let move_count = (sibling.used_slots() - page.used_slots()) / 2;
            let slots: Vec<usize> = sibling.occupied_slots().collect();
            let moving: Vec<usize> = if sibling_is_left {
                slots[slots.len() - move_count..].to_vec()
            } else {
                slots[..move_count].to_vec()
            };
            for slot in moving {
                let mut tuple = sibling.tuple_at(slot).unwrap().clone();
                sibling.remove_slot(slot);
                tuple.set_record_id(None);
                page.insert_tuple(tuple)?;
            }
            //  the separator is the first key of the right-hand page
            if sibling_is_left {
                page.first_key()?
            } else {
                sibling.first_key()?
            }
        };
        debug!(
            page = page_pid.page_no,
            sibling = sibling_pid.page_no,
            separator = %separator,
            "stole records from leaf sibling"
        );
        tx.mark_dirty(&page_pid);
        tx.mark_dirty(&sibling_pid);

        entry.set_key(separator);
        let parent_arc = self.get_page(tx, ws, &parent_pid, Permission::ReadWrite)?;
        parent_arc
            .lock()
            .unwrap()
            .as_internal_mut()?
            .update_entry(&entry)?;
        tx.mark_dirty(&parent_pid);
        Ok(())
    }

    /// Rotate entries from a rich left internal sibling through the
    /// parent: the parent key comes down as a bridge, the sibling's last
    /// key goes up.
    fn steal_from_left_internal_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        page_pid: BTreePageId,
        sibling_pid: BTreePageId,
        parent_pid: BTreePageId,
        mut entry: Entry,
    ) -> Result<()> {
        let page_arc = self.get_page(tx, ws, &page_pid, Permission::ReadWrite)?;
        let sibling_arc = self.get_page(tx, ws, &sibling_pid, Permission::ReadWrite)?;
        {
            let mut page_guard = page_arc.lock().unwrap();
            let page = page_guard.as_internal_mut()?;
            let mut sibling_guard = sibling_arc.lock().unwrap();
            let sibling = sibling_guard.as_internal_mut()?;

            let move_count = (sibling.used_entries() - page.used_entries()) / 2;
            for _ in 0..move_count {
                let donated = sibling.iter().next_back().unwrap();
                let bridge = Entry::new(
                    entry.key().clone(),
                    donated.right_child(),
                    page.first_child_id()?,
                );
                page.insert_entry(bridge)?;
                entry.set_key(donated.key().clone());
                sibling.delete_key_and_right_child(&donated)?;
            }
        }
        debug!(
            page = page_pid.page_no,
            sibling = sibling_pid.page_no,
            "stole entries from left internal sibling"
        );
        tx.mark_dirty(&page_pid);
        tx.mark_dirty(&sibling_pid);

        self.update_parent_pointers(tx, ws, &page_pid)?;

        let parent_arc = self.get_page(tx, ws, &parent_pid, Permission::ReadWrite)?;
        parent_arc
            .lock()
            .unwrap()
            .as_internal_mut()?
            .update_entry(&entry)?;
        tx.mark_dirty(&parent_pid);
        Ok(())
    }

    /// Mirror of [`BTreeFile::steal_from_left_internal_page`] for a rich
    /// right sibling.
    fn steal_from_right_internal_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        page_pid: BTreePageId,
        sibling_pid: BTreePageId,
        parent_pid: BTreePageId,
        mut entry: Entry,
    ) -> Result<()> {
        let page_arc = self.get_page(tx, ws, &page_pid, Permission::ReadWrite)?;
        let sibling_arc = self.get_page(tx, ws, &sibling_pid, Permission::ReadWrite)?;
        {
            let mut page_guard = page_arc.lock().unwrap();
            let page = page_guard.as_internal_mut()?;
            let mut sibling_guard = sibling_arc.lock().unwrap();
            let sibling = sibling_guard.as_internal_mut()?;

            let move_count = (sibling.used_entries() - page.used_entries()) / 2;
            for _ in 0..move_count {
                let donated = sibling.iter().next().unwrap();
                let bridge = Entry::new(
                    entry.key().clone(),
                    page.last_child_id()?,
                    donated.left_child(),
                );
                page.insert_entry(bridge)?;
                entry.set_key(donated.key().clone());
                sibling.delete_key_and_left_child(&donated)?;
            }
        }
        debug!(
            page = page_pid.page_no,
            sibling = sibling_pid.page_no,
            "stole entries from right internal sibling"
        );
        tx.mark_dirty(&page_pid);
        tx.mark_dirty(&sibling_pid);

        self.update_parent_pointers(tx, ws, &page_pid)?;

        let parent_arc = self.get_page(tx, ws, &parent_pid, Permission::ReadWrite)?;
        parent_arc
            .lock()
            .unwrap()
            .as_internal_mut()?
            .update_entry(&entry)?;
        tx.mark_dirty(&parent_pid);
        Ok(())
    }

    /// Merge two adjacent leaves: the right page's records move into the
    /// left, the sibling chain is relinked around the right page, and the
    /// right page is returned to the free list.
    fn merge_leaf_pages(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        left_pid: BTreePageId,
        right_pid: BTreePageId,
        parent_pid: BTreePageId,
        entry: Entry,
    ) -> Result<()> {
        let left_arc = self.get_page(tx, ws, &left_pid, Permission::ReadWrite)?;
        let right_arc = self.get_page(tx, ws, &right_pid, Permission::ReadWrite)?;

        let right_right = {
            let mut left_guard = left_arc.lock().unwrap();
            let left = left_guard.as_leaf_mut()?;
            let mut right_guard = right_arc.lock().unwrap();
            let right = right_guard.as_leaf_mut()?;

            let slots: Vec<usize> = right.occupied_slots().collect();
            for slot in slots {
                let mut tuple = right.tuple_at(slot).unwrap().clone();
                right.remove_slot(slot);
                tuple.set_record_id(None);
                left.insert_tuple(tuple)?;
            }
            let right_right = right.right_sibling_id();
            left.set_right_sibling_id(right_right.as_ref())?;
            right_right
        };
        debug!(
            left = left_pid.page_no,
            right = right_pid.page_no,
            "merged leaf pages"
        );
        tx.mark_dirty(&left_pid);

        if let Some(rr_pid) = right_right {
            let arc = self.get_page(tx, ws, &rr_pid, Permission::ReadWrite)?;
            arc.lock()
                .unwrap()
                .as_leaf_mut()?
                .set_left_sibling_id(Some(&left_pid))?;
            tx.mark_dirty(&rr_pid);
        }

        self.set_empty_page(tx, ws, &right_pid)?;
        self.delete_parent_entry(tx, ws, left_pid, parent_pid, entry)
    }

    /// Merge two adjacent internal pages: the parent separator comes down
    /// as a bridge between the left page's last child and the right
    /// page's first, then the right page's entries follow it across.
    fn merge_internal_pages(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        left_pid: BTreePageId,
        right_pid: BTreePageId,
        parent_pid: BTreePageId,
        entry: Entry,
    ) -> Result<()> {
        let left_arc = self.get_page(tx, ws, &left_pid, Permission::ReadWrite)?;
        let right_arc = self.get_page(tx, ws, &right_pid, Permission::ReadWrite)?;
        {
            let mut left_guard = left_arc.lock().unwrap();
            let left = left_guard.as_internal_mut()?;
            let mut right_guard = right_arc.lock().unwrap();
            let right = right_guard.as_internal_mut()?;

            let bridge = Entry::new(
                entry.key().clone(),
                left.last_child_id()?,
                right.first_child_id()?,
            );
            left.insert_entry(bridge)?;
            for moved in right.iter().collect::<Vec<_>>() {
                left.insert_entry(Entry::new(
                    moved.key().clone(),
                    moved.left_child(),
                    moved.right_child(),
                ))?;
            }
        }
        debug!(
            left = left_pid.page_no,
            right = right_pid.page_no,
            "merged internal pages"
        );
        tx.mark_dirty(&left_pid);

        self.update_parent_pointers(tx, ws, &left_pid)?;
        self.set_empty_page(tx, ws, &right_pid)?;
        self.delete_parent_entry(tx, ws, left_pid, parent_pid, entry)
    }

    /// Remove the separator for a completed merge from the parent. An
    /// emptied root hands the tree down to the merged page (the tree
    /// shrinks by a level); any other parent falling under half full is
    /// rebalanced in turn.
    fn delete_parent_entry(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        left_pid: BTreePageId,
        parent_pid: BTreePageId,
        entry: Entry,
    ) -> Result<()> {
        let parent_arc = self.get_page(tx, ws, &parent_pid, Permission::ReadWrite)?;
        let (emptied, underfull, grandparent) = {
            let mut guard = parent_arc.lock().unwrap();
            let parent = guard.as_internal_mut()?;
            parent.delete_key_and_right_child(&entry)?;
            (
                parent.used_entries() == 0,
                parent.empty_slots() > max_empty_slots(parent.capacity()),
                parent.parent_id(),
            )
        };
        tx.mark_dirty(&parent_pid);

        if emptied {
            if grandparent.category != PageCategory::RootPtr {
                return Err(DbError::invalid(format!(
                    "non-root internal page {parent_pid} was left empty"
                )));
            }
            //  collapse the root
            let arc = self.get_page(tx, ws, &self.root_ptr_pid(), Permission::ReadWrite)?;
            arc.lock()
                .unwrap()
                .as_root_ptr_mut()?
                .set_root_id(&left_pid)?;
            tx.mark_dirty(&self.root_ptr_pid());
            let arc = self.get_page(tx, ws, &left_pid, Permission::ReadWrite)?;
            arc.lock().unwrap().set_parent_id(&self.root_ptr_pid())?;
            tx.mark_dirty(&left_pid);
            debug!(root = left_pid.page_no, "collapsed root");
            self.set_empty_page(tx, ws, &parent_pid)?;
        } else if underfull {
            self.handle_underfull_page(tx, ws, parent_pid)?;
        }
        Ok(())
    }

    /// Hand out a reusable page number: the first free slot in the header
    /// chain, or a page appended to the file when nothing is free.
    fn get_empty_page_no(&self, tx: &Transaction, ws: &mut WorkingSet) -> Result<usize> {
        let mut header_id = {
            let arc = self.get_page(tx, ws, &self.root_ptr_pid(), Permission::ReadOnly)?;
            let guard = arc.lock().unwrap();
            guard.as_root_ptr()?.header_id()
        };
        let mut base = 0usize;
        while let Some(hid) = header_id {
            let (slot, next) = {
                let arc = self.get_page(tx, ws, &hid, Permission::ReadOnly)?;
                let guard = arc.lock().unwrap();
                let header = guard.as_header()?;
                (header.first_empty_slot(), header.next_id())
            };
            if let Some(slot) = slot {
                let arc = self.get_page(tx, ws, &hid, Permission::ReadWrite)?;
                arc.lock().unwrap().as_header_mut()?.mark_slot_used(slot)?;
                tx.mark_dirty(&hid);
                let page_no = base + slot + 1;
                debug!(page_no, "reusing freed page");
                return Ok(page_no);
            }
            base += self.slots_per_header();
            header_id = next;
        }
        self.file.allocate_page()
    }

    /// A fresh, wiped page of the requested category, added to the
    /// working set and marked dirty.
    fn get_empty_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        category: PageCategory,
    ) -> Result<(BTreePageId, Arc<Mutex<BTreePage>>)> {
        let page_no = self.get_empty_page_no(tx, ws)?;
        let pid = self.pid(page_no, category);
        let page = tx.wipe_page(&pid)?;
        ws.insert(pid, Arc::clone(&page));
        Ok((pid, page))
    }

    /// Return `pid` to the free list, extending the header chain to cover
    /// its slot if necessary. The in-memory object for the page is
    /// dropped; the stale bytes on disk are wiped on reuse.
    fn set_empty_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        pid: &BTreePageId,
    ) -> Result<()> {
        ws.retain(|cached, _| !(cached.table_id == pid.table_id && cached.page_no == pid.page_no));
        tx.pool().discard_page(pid);
        debug!(page = %pid, "freed page");

        let root_ptr_arc = self.get_page(tx, ws, &self.root_ptr_pid(), Permission::ReadWrite)?;
        let mut header_id = {
            let guard = root_ptr_arc.lock().unwrap();
            guard.as_root_ptr()?.header_id()
        };
        if header_id.is_none() {
            let hid = self.create_header_page(tx, ws, None)?;
            root_ptr_arc
                .lock()
                .unwrap()
                .as_root_ptr_mut()?
                .set_header_id(Some(&hid))?;
            tx.mark_dirty(&self.root_ptr_pid());
            header_id = Some(hid);
        }

        let target = pid.page_no - 1;
        let capacity = self.slots_per_header();
        let mut base = 0usize;
        let mut current = header_id.unwrap();
        loop {
            if target < base + capacity {
                let arc = self.get_page(tx, ws, &current, Permission::ReadWrite)?;
                arc.lock()
                    .unwrap()
                    .as_header_mut()?
                    .mark_slot_free(target - base)?;
                tx.mark_dirty(&current);
                return Ok(());
            }
            let next = {
                let arc = self.get_page(tx, ws, &current, Permission::ReadOnly)?;
                let guard = arc.lock().unwrap();
                guard.as_header()?.next_id()
            };
            match next {
                Some(next) => {
                    base += capacity;
                    current = next;
                }
                None => {
                    let new_hid = self.create_header_page(tx, ws, Some(&current))?;
                    let arc = self.get_page(tx, ws, &current, Permission::ReadWrite)?;
                    arc.lock()
                        .unwrap()
                        .as_header_mut()?
                        .set_next_id(Some(&new_hid));
                    tx.mark_dirty(&current);
                    base += capacity;
                    current = new_hid;
                }
            }
        }
    }

    /// Create a header page at the end of the file. Its bitmap starts
    /// all-used so pages the chain does not track are never handed out.
    fn create_header_page(
        &self,
        tx: &Transaction,
        ws: &mut WorkingSet,
        prev: Option<&BTreePageId>,
    ) -> Result<BTreePageId> {
        //  appended directly rather than drawn from the free list, which
        //  may be mid-extension right now
        let page_no = self.file.allocate_page()?;
        let hid = self.pid(page_no, PageCategory::Header);
        let page = tx.wipe_page(&hid)?;
        ws.insert(hid, Arc::clone(&page));
        {
            let mut guard = page.lock().unwrap();
            let header = guard.as_header_mut()?;
            header.mark_all_used();
            header.set_prev_id(prev);
        }
        debug!(page_no, "created header page");
        Ok(hid)
    }

    /// Scan the whole index in key order.
    pub fn iter<'a>(&'a self, tx: &'a Transaction) -> Result<BTreeIterator<'a>> {
        self.search_inner(tx, None)
    }

    /// Scan the tuples matching `predicate` in key order, touching only
    /// the leaves that can contain matches.
    pub fn search<'a>(
        &'a self,
        tx: &'a Transaction,
        predicate: IndexPredicate,
    ) -> Result<BTreeIterator<'a>> {
        self.search_inner(tx, Some(predicate))
    }

    fn search_inner<'a>(
        &'a self,
        tx: &'a Transaction,
        predicate: Option<IndexPredicate>,
    ) -> Result<BTreeIterator<'a>> {
        let mut ws = WorkingSet::new();
        let start = match self.root_id(tx, &mut ws, Permission::ReadOnly)? {
            None => None,
            Some(root_id) => Some(self.find_leaf_page(
                tx,
                &mut ws,
                root_id,
                predicate.as_ref().and_then(|p| p.seek_key()),
                Permission::ReadOnly,
            )?),
        };
        Ok(BTreeIterator {
            file: self,
            tx,
            predicate,
            next_leaf: start,
            buffered: VecDeque::new(),
            finished: false,
        })
    }
}

/// Comparison operator for an index scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equals,
    GreaterThan,
    GreaterThanOrEq,
    LessThan,
    LessThanOrEq,
}

/// A single-operator predicate over the key field.
#[derive(Debug, Clone)]
pub struct IndexPredicate {
    op: Op,
    value: Value,
}

impl IndexPredicate {
    pub fn new(op: Op, value: Value) -> Self {
        Self { op, value }
    }

    fn matches(&self, key: &Value) -> bool {
        match self.op {
            Op::Equals => key == &self.value,
            Op::GreaterThan => key > &self.value,
            Op::GreaterThanOrEq => key >= &self.value,
            Op::LessThan => key < &self.value,
            Op::LessThanOrEq => key <= &self.value,
        }
    }

    /// Whether no key at or beyond `key` can match, so the scan may stop.
    fn exhausted(&self, key: &Value) -> bool {
        match self.op {
            Op::Equals => key > &self.value,
            Op::LessThan => key >= &self.value,
            Op::LessThanOrEq => key > &self.value,
            Op::GreaterThan | Op::GreaterThanOrEq => false,
        }
    }

    /// The key to descend the tree with. `None` means start at the
    /// leftmost leaf.
    fn seek_key(&self) -> Option<&Value> {
        match self.op {
            Op::Equals | Op::GreaterThan | Op::GreaterThanOrEq => Some(&self.value),
            Op::LessThan | Op::LessThanOrEq => None,
        }
    }
}

/// An in-order scan over the leaf chain. Leaves are read under shared
/// locks one at a time; each leaf's matching tuples are buffered before
/// moving right.
pub struct BTreeIterator<'a> {
    file: &'a BTreeFile,
    tx: &'a Transaction,
    predicate: Option<IndexPredicate>,
    next_leaf: Option<BTreePageId>,
    buffered: VecDeque<Tuple>,
    finished: bool,
}

impl BTreeIterator<'_> {
    fn fill_from(&mut self, pid: BTreePageId) -> Result<()> {
        let arc = self.tx.get_page(&pid, Permission::ReadOnly)?;
        let guard = arc.lock().unwrap();
        let leaf = guard.as_leaf()?;
        for tuple in leaf.iter() {
            let key = tuple.value(self.file.key_field());
            if let Some(predicate) = &self.predicate {
                if predicate.exhausted(key) {
                    self.finished = true;
                    break;
                }
                if !predicate.matches(key) {
                    continue;
                }
            }
            self.buffered.push_back(tuple.clone());
        }
        if !self.finished {
            self.next_leaf = leaf.right_sibling_id();
        }
        Ok(())
    }
}

impl Iterator for BTreeIterator<'_> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(tuple) = self.buffered.pop_front() {
                return Some(Ok(tuple));
            }
            if self.finished {
                return None;
            }
            let pid = match self.next_leaf.take() {
                Some(pid) => pid,
                None => {
                    self.finished = true;
                    return None;
                }
            };
            if let Err(e) = self.fill_from(pid) {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod btree_tests {
    use super::*;
    use crate::check::check_tree;
    use crate::types::FieldType;
    use crate::Database;

    const PAGE_SIZE: usize = 64;

    fn test_layout() -> Layout {
        Layout::new(vec![FieldType::Int, FieldType::Int])
    }

    fn tuple(key: i32) -> Tuple {
        Tuple::new(vec![Value::Int(key), Value::Int(key * 10)])
    }

    fn scan_keys(index: &BTreeFile, tx: &Transaction) -> Vec<i32> {
        index
            .iter(tx)
            .unwrap()
            .map(|t| match t.unwrap().value(0) {
                Value::Int(v) => *v,
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_insert_and_scan_single_leaf() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 64, 200);
        let index = db.open_index("single_leaf", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        for key in [3, 1, 2] {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        assert_eq!(scan_keys(&index, &tx), vec![1, 2, 3]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_empty_index_scans_empty() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 64, 200);
        let index = db.open_index("empty", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        assert!(index.iter(&tx).unwrap().next().is_none());
        assert!(index
            .search(&tx, IndexPredicate::new(Op::Equals, Value::Int(1)))
            .unwrap()
            .next()
            .is_none());
        tx.commit().unwrap();
    }

    #[test]
    fn test_ordered_inserts_split_and_stay_sorted() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 2048, 1000);
        let index = db.open_index("ordered", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        for key in 0..1000 {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        check_tree(&index, &tx, true).unwrap();
        let keys = scan_keys(&index, &tx);
        assert_eq!(keys, (0..1000).collect::<Vec<_>>());
        tx.commit().unwrap();

        //  durable after commit
        let tx = db.new_tx();
        assert_eq!(scan_keys(&index, &tx).len(), 1000);
        check_tree(&index, &tx, true).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_descending_inserts_stay_sorted() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 512, 1000);
        let index = db.open_index("descending", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        for key in (0..300).rev() {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        check_tree(&index, &tx, true).unwrap();
        assert_eq!(scan_keys(&index, &tx), (0..300).collect::<Vec<_>>());
        tx.commit().unwrap();
    }

    #[test]
    fn test_reverse_deletes_collapse_the_tree() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 512, 1000);
        let index = db.open_index("collapse", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        for key in 0..200 {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        tx.commit().unwrap();

        let tx = db.new_tx();
        for key in (0..200).rev() {
            let found = index
                .search(&tx, IndexPredicate::new(Op::Equals, Value::Int(key)))
                .unwrap()
                .next()
                .unwrap()
                .unwrap();
            index.delete_tuple(&tx, &found).unwrap();
            check_tree(&index, &tx, true).unwrap();
        }
        assert!(scan_keys(&index, &tx).is_empty());
        tx.commit().unwrap();

        //  freed pages are reused on reinsertion
        let tx = db.new_tx();
        let before = index.num_pages().unwrap();
        for key in 0..200 {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        assert_eq!(index.num_pages().unwrap(), before);
        check_tree(&index, &tx, true).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_interleaved_deletes_rebalance() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 512, 1000);
        let index = db.open_index("rebalance", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        for key in 0..300 {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        //  delete every other key so steals and merges both happen
        for key in (0..300).step_by(2) {
            let found = index
                .search(&tx, IndexPredicate::new(Op::Equals, Value::Int(key)))
                .unwrap()
                .next()
                .unwrap()
                .unwrap();
            index.delete_tuple(&tx, &found).unwrap();
            check_tree(&index, &tx, true).unwrap();
        }
        assert_eq!(
            scan_keys(&index, &tx),
            (0..300).filter(|k| k % 2 == 1).collect::<Vec<_>>()
        );
        tx.commit().unwrap();
    }

    #[test]
    fn test_range_scan() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 2048, 1000);
        let index = db.open_index("range", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        for key in 0..1000 {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        //  [100, 200] inclusive: greater-or-equal scan cut at 200
        let keys: Vec<i32> = index
            .search(
                &tx,
                IndexPredicate::new(Op::GreaterThanOrEq, Value::Int(100)),
            )
            .unwrap()
            .map(|t| match t.unwrap().value(0) {
                Value::Int(v) => *v,
                _ => unreachable!(),
            })
            .take_while(|&k| k <= 200)
            .collect();
        assert_eq!(keys.len(), 101);
        assert_eq!(keys, (100..=200).collect::<Vec<_>>());

        let below: Vec<i32> = index
            .search(&tx, IndexPredicate::new(Op::LessThan, Value::Int(5)))
            .unwrap()
            .map(|t| match t.unwrap().value(0) {
                Value::Int(v) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(below, vec![0, 1, 2, 3, 4]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_duplicate_keys_span_leaves() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 512, 1000);
        let index = db.open_index("duplicates", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        for payload in 0..50 {
            index
                .insert_tuple(&tx, Tuple::new(vec![Value::Int(7), Value::Int(payload)]))
                .unwrap();
        }
        for key in [1, 2, 3, 100, 200] {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        let matches: Vec<Tuple> = index
            .search(&tx, IndexPredicate::new(Op::Equals, Value::Int(7)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(matches.len(), 50);
        assert!(matches.iter().all(|t| t.value(0) == &Value::Int(7)));
        check_tree(&index, &tx, true).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_inserting_only_duplicates_splits_cleanly() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 2048, 1000);
        let index = db.open_index("all_dup", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        //  every separator and every pushed-up middle key ties, so split
        //  routing cannot rely on key comparisons anywhere on the path
        for payload in 0..150 {
            index
                .insert_tuple(&tx, Tuple::new(vec![Value::Int(7), Value::Int(payload)]))
                .unwrap();
            check_tree(&index, &tx, true).unwrap();
        }
        let matches: Vec<Tuple> = index
            .search(&tx, IndexPredicate::new(Op::Equals, Value::Int(7)))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(matches.len(), 150);
        tx.commit().unwrap();
    }

    #[test]
    fn test_delete_requires_record_id() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 64, 200);
        let index = db.open_index("no_rid", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        index.insert_tuple(&tx, tuple(1)).unwrap();
        assert!(index.delete_tuple(&tx, &tuple(1)).is_err());
        tx.commit().unwrap();
    }

    #[test]
    fn test_abort_discards_inserts() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 512, 1000);
        let index = db.open_index("abort", test_layout(), 0).unwrap();
        let tx = db.new_tx();
        for key in 0..50 {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        tx.commit().unwrap();

        let tx = db.new_tx();
        for key in 50..100 {
            index.insert_tuple(&tx, tuple(key)).unwrap();
        }
        tx.abort();

        let tx = db.new_tx();
        assert_eq!(scan_keys(&index, &tx), (0..50).collect::<Vec<_>>());
        check_tree(&index, &tx, true).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_concurrent_inserts() {
        let (db, _dir) = Database::new_for_test(PAGE_SIZE, 2048, 5000);
        let db = std::sync::Arc::new(db);
        let index = std::sync::Arc::new(db.open_index("concurrent", test_layout(), 0).unwrap());

        let mut handles = Vec::new();
        for worker in 0..4i32 {
            let db = std::sync::Arc::clone(&db);
            let index = std::sync::Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                let mut inserted = 0usize;
                for key in (worker * 100)..(worker * 100 + 100) {
                    //  retry on lock-timeout aborts
                    loop {
                        let tx = db.new_tx();
                        match index.insert_tuple(&tx, tuple(key)) {
                            Ok(()) => {
                                tx.commit().unwrap();
                                inserted += 1;
                                break;
                            }
                            Err(DbError::TransactionAborted) => {
                                tx.abort();
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
                inserted
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 400);

        let tx = db.new_tx();
        assert_eq!(scan_keys(&index, &tx), (0..400).collect::<Vec<_>>());
        check_tree(&index, &tx, true).unwrap();
        tx.commit().unwrap();
    }
}
