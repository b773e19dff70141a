use crate::error::{DbError, Result};
use crate::types::{FieldType, Layout, RecordId, Tuple, Value};

const INT_BYTES: usize = 4;

/// The size in bytes of the root pointer page: root page number (4),
/// root category (1), first header page number (4). Every data page after
/// it is `page_size` bytes, so data page `n` starts at byte
/// `ROOT_PTR_PAGE_SIZE + (n - 1) * page_size`.
pub const ROOT_PTR_PAGE_SIZE: usize = 9;

/// The kind of a page. Pages do not self-describe their category on disk;
/// it comes from the identifier used to read them.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageCategory {
    RootPtr = 0,
    Internal = 1,
    Leaf = 2,
    Header = 3,
}

impl PageCategory {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageCategory::RootPtr),
            1 => Ok(PageCategory::Internal),
            2 => Ok(PageCategory::Leaf),
            3 => Ok(PageCategory::Header),
            other => Err(DbError::invalid(format!("invalid page category {other}"))),
        }
    }
}

impl std::fmt::Display for PageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PageCategory::RootPtr => "root-ptr",
            PageCategory::Internal => "internal",
            PageCategory::Leaf => "leaf",
            PageCategory::Header => "header",
        };
        write!(f, "{name}")
    }
}

/// The identifier of a page: which index file it belongs to, its page
/// number within that file, and its category. Page number 0 is always the
/// root pointer page; data pages start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BTreePageId {
    pub table_id: u32,
    pub page_no: usize,
    pub category: PageCategory,
}

impl BTreePageId {
    pub fn new(table_id: u32, page_no: usize, category: PageCategory) -> Self {
        Self {
            table_id,
            page_no,
            category,
        }
    }
}

impl std::fmt::Display for BTreePageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(table {}, page {}, {})",
            self.table_id, self.page_no, self.category
        )
    }
}

/// The number of bytes needed to hold `bits` bits.
pub(crate) fn bitmap_bytes(bits: usize) -> usize {
    (bits + 7) / 8
}

/// A fixed-length bit vector backing the page occupancy and free-list
/// bitmaps. Bit i of byte b is bit `b * 8 + i`, lowest bit first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitVec {
    bytes: Vec<u8>,
    len: usize,
}

impl BitVec {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; bitmap_bytes(len)],
            len,
        }
    }

    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        debug_assert!(bytes.len() >= bitmap_bytes(len));
        Self {
            bytes: bytes[..bitmap_bytes(len)].to_vec(),
            len,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.bytes[index / 8] |= 1 << (index % 8);
    }

    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.bytes[index / 8] &= !(1 << (index % 8));
    }

    pub fn set_all(&mut self) {
        for index in 0..self.len {
            self.set(index);
        }
    }

    pub fn count_set(&self) -> usize {
        (0..self.len).filter(|&i| self.get(i)).count()
    }

    pub fn first_clear(&self) -> Option<usize> {
        (0..self.len).find(|&i| !self.get(i))
    }
}

fn read_i32(buf: &[u8], offset: usize) -> usize {
    let bytes: [u8; INT_BYTES] = buf[offset..offset + INT_BYTES].try_into().unwrap();
    i32::from_be_bytes(bytes) as usize
}

fn write_i32(buf: &mut [u8], offset: usize, value: usize) {
    buf[offset..offset + INT_BYTES].copy_from_slice(&(value as i32).to_be_bytes());
}

/// An entry on an internal page: a key and the pages to either side of it.
/// All keys in the left child's subtree are <= the key, which is <= all
/// keys in the right child's subtree. The slot is set once the entry has
/// been placed on (or read from) a page.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    key: Value,
    left_child: BTreePageId,
    right_child: BTreePageId,
    slot: Option<usize>,
}

impl Entry {
    pub fn new(key: Value, left_child: BTreePageId, right_child: BTreePageId) -> Self {
        Self {
            key,
            left_child,
            right_child,
            slot: None,
        }
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn set_key(&mut self, key: Value) {
        self.key = key;
    }

    pub fn left_child(&self) -> BTreePageId {
        self.left_child
    }

    pub fn right_child(&self) -> BTreePageId {
        self.right_child
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        self.slot
    }
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} <= {} <= {}",
            self.left_child.page_no, self.key, self.right_child.page_no
        )
    }
}

/// The capacity in records of a leaf page: three page pointers, one
/// occupancy bit per slot, and the slots themselves must fit.
pub fn leaf_capacity(page_size: usize, layout: &Layout) -> usize {
    let tuple_bits = layout.tuple_size() * 8;
    let mut capacity = (page_size * 8 - 3 * 32) / (tuple_bits + 1);
    while 3 * INT_BYTES + bitmap_bytes(capacity) + capacity * layout.tuple_size() > page_size {
        capacity -= 1;
    }
    capacity
}

/// The capacity in entries of an internal page: a parent pointer, the
/// child category tag, capacity + 1 occupancy bits, capacity key slots
/// and capacity + 1 child pointers must fit.
pub fn internal_capacity(page_size: usize, key_type: FieldType) -> usize {
    let key_size = key_type.byte_size();
    let key_bits = key_size * 8;
    let mut capacity = (page_size * 8 - 2 * 32 - 8) / (key_bits + 32 + 1);
    while INT_BYTES
        + 1
        + bitmap_bytes(capacity + 1)
        + capacity * key_size
        + (capacity + 1) * INT_BYTES
        > page_size
    {
        capacity -= 1;
    }
    capacity
}

/// The number of page slots a header page tracks: everything except the
/// prev/next pointers is bitmap.
pub fn header_capacity(page_size: usize) -> usize {
    (page_size - 2 * INT_BYTES) * 8
}

/// The root pointer page, always at page number 0. It records the current
/// root page and the head of the header page chain. A page number of 0
/// in either field means "none".
#[derive(Debug, Clone)]
pub struct RootPtrPage {
    pid: BTreePageId,
    root: usize,
    root_category: PageCategory,
    header: usize,
}

impl RootPtrPage {
    pub fn new_empty(pid: BTreePageId) -> Self {
        Self {
            pid,
            root: 0,
            root_category: PageCategory::Leaf,
            header: 0,
        }
    }

    pub fn from_bytes(pid: BTreePageId, data: &[u8]) -> Result<Self> {
        if data.len() != ROOT_PTR_PAGE_SIZE {
            return Err(DbError::invalid(format!(
                "root pointer page must be {ROOT_PTR_PAGE_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let root = read_i32(data, 0);
        let root_category = if root == 0 {
            PageCategory::Leaf
        } else {
            PageCategory::from_u8(data[INT_BYTES])?
        };
        if root != 0
            && root_category != PageCategory::Leaf
            && root_category != PageCategory::Internal
        {
            return Err(DbError::invalid(format!(
                "root category must be leaf or internal, got {root_category}"
            )));
        }
        let header = read_i32(data, INT_BYTES + 1);
        Ok(Self {
            pid,
            root,
            root_category,
            header,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; ROOT_PTR_PAGE_SIZE];
        write_i32(&mut data, 0, self.root);
        data[INT_BYTES] = self.root_category as u8;
        write_i32(&mut data, INT_BYTES + 1, self.header);
        data
    }

    pub fn id(&self) -> BTreePageId {
        self.pid
    }

    pub fn root_id(&self) -> Option<BTreePageId> {
        if self.root == 0 {
            None
        } else {
            Some(BTreePageId::new(
                self.pid.table_id,
                self.root,
                self.root_category,
            ))
        }
    }

    pub fn set_root_id(&mut self, root: &BTreePageId) -> Result<()> {
        if root.table_id != self.pid.table_id {
            return Err(DbError::invalid("root page belongs to a different index"));
        }
        if root.category != PageCategory::Leaf && root.category != PageCategory::Internal {
            return Err(DbError::invalid(format!(
                "root must be a leaf or internal page, got {}",
                root.category
            )));
        }
        self.root = root.page_no;
        self.root_category = root.category;
        Ok(())
    }

    pub fn header_id(&self) -> Option<BTreePageId> {
        if self.header == 0 {
            None
        } else {
            Some(BTreePageId::new(
                self.pid.table_id,
                self.header,
                PageCategory::Header,
            ))
        }
    }

    pub fn set_header_id(&mut self, header: Option<&BTreePageId>) -> Result<()> {
        match header {
            None => self.header = 0,
            Some(pid) => {
                if pid.category != PageCategory::Header {
                    return Err(DbError::invalid(format!(
                        "expected a header page id, got {}",
                        pid.category
                    )));
                }
                self.header = pid.page_no;
            }
        }
        Ok(())
    }
}

/// A leaf page: records sorted by the key field, an occupancy bitmap, a
/// parent pointer and left/right sibling pointers. Deletes leave gaps so
/// record ids stay stable; inserts shift only as far as the nearest gap.
#[derive(Debug, Clone)]
pub struct LeafPage {
    pid: BTreePageId,
    layout: Layout,
    key_field: usize,
    page_size: usize,
    capacity: usize,
    parent: usize,
    left: usize,
    right: usize,
    occupancy: BitVec,
    tuples: Vec<Option<Tuple>>,
}

impl LeafPage {
    pub fn new_empty(pid: BTreePageId, layout: Layout, key_field: usize, page_size: usize) -> Self {
        let capacity = leaf_capacity(page_size, &layout);
        Self {
            pid,
            layout,
            key_field,
            page_size,
            capacity,
            parent: 0,
            left: 0,
            right: 0,
            occupancy: BitVec::new(capacity),
            tuples: vec![None; capacity],
        }
    }

    pub fn from_bytes(
        pid: BTreePageId,
        layout: Layout,
        key_field: usize,
        page_size: usize,
        data: &[u8],
    ) -> Result<Self> {
        debug_assert_eq!(data.len(), page_size);
        let capacity = leaf_capacity(page_size, &layout);
        let parent = read_i32(data, 0);
        let left = read_i32(data, INT_BYTES);
        let right = read_i32(data, 2 * INT_BYTES);
        let bitmap_start = 3 * INT_BYTES;
        let occupancy = BitVec::from_bytes(&data[bitmap_start..], capacity);
        let slots_start = bitmap_start + bitmap_bytes(capacity);
        let tuple_size = layout.tuple_size();
        let mut tuples = vec![None; capacity];
        for slot in 0..capacity {
            if occupancy.get(slot) {
                let start = slots_start + slot * tuple_size;
                let mut tuple = Tuple::read_from(&data[start..start + tuple_size], &layout)?;
                tuple.set_record_id(Some(RecordId::new(pid, slot)));
                tuples[slot] = Some(tuple);
            }
        }
        Ok(Self {
            pid,
            layout,
            key_field,
            page_size,
            capacity,
            parent,
            left,
            right,
            occupancy,
            tuples,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.page_size];
        write_i32(&mut data, 0, self.parent);
        write_i32(&mut data, INT_BYTES, self.left);
        write_i32(&mut data, 2 * INT_BYTES, self.right);
        let bitmap_start = 3 * INT_BYTES;
        data[bitmap_start..bitmap_start + bitmap_bytes(self.capacity)]
            .copy_from_slice(self.occupancy.as_bytes());
        let slots_start = bitmap_start + bitmap_bytes(self.capacity);
        let tuple_size = self.layout.tuple_size();
        for slot in 0..self.capacity {
            if let Some(tuple) = &self.tuples[slot] {
                let start = slots_start + slot * tuple_size;
                tuple.write_to(&mut data[start..start + tuple_size], &self.layout)?;
            }
        }
        Ok(data)
    }

    pub fn id(&self) -> BTreePageId {
        self.pid
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_slots(&self) -> usize {
        self.occupancy.count_set()
    }

    pub fn empty_slots(&self) -> usize {
        self.capacity - self.used_slots()
    }

    pub fn key_field(&self) -> usize {
        self.key_field
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn tuple_at(&self, slot: usize) -> Option<&Tuple> {
        self.tuples.get(slot).and_then(|t| t.as_ref())
    }

    /// The occupied slot indices, in slot (and therefore key) order.
    pub fn occupied_slots(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        (0..self.capacity).filter(move |&slot| self.occupancy.get(slot))
    }

    /// The stored tuples in key order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Tuple> {
        self.tuples.iter().filter_map(|t| t.as_ref())
    }

    fn key_at(&self, slot: usize) -> Option<&Value> {
        self.tuple_at(slot).map(|t| t.value(self.key_field))
    }

    /// The key of the first stored tuple.
    pub fn first_key(&self) -> Result<Value> {
        self.iter()
            .next()
            .map(|t| t.value(self.key_field).clone())
            .ok_or_else(|| DbError::invalid(format!("leaf page {} is empty", self.pid)))
    }

    /// Move the record in `from` to the empty slot `to`, updating its
    /// record id. A no-op when `from` is empty.
    fn move_record(&mut self, from: usize, to: usize) {
        if self.occupancy.get(from) && !self.occupancy.get(to) {
            let mut tuple = self.tuples[from].take().unwrap();
            tuple.set_record_id(Some(RecordId::new(self.pid, to)));
            self.tuples[to] = Some(tuple);
            self.occupancy.clear(from);
            self.occupancy.set(to);
        }
    }

    /// Insert a tuple in key order. The record keeps its sorted position
    /// by shifting records between the nearest empty slot and the
    /// insertion point; every shifted record's id is updated. The tuple's
    /// record id is set to its final location.
    pub fn insert_tuple(&mut self, mut tuple: Tuple) -> Result<()> {
        self.layout.check_tuple(&tuple)?;
        let empty_slot = self
            .occupancy
            .first_clear()
            .ok_or_else(|| DbError::invalid(format!("no empty slots on leaf page {}", self.pid)))?;

        //  find the last occupied slot with a key <= the new key
        let key = tuple.value(self.key_field).clone();
        let mut less_or_eq: Option<usize> = None;
        for slot in self.occupied_slots().collect::<Vec<_>>() {
            if self.key_at(slot).unwrap() <= &key {
                less_or_eq = Some(slot);
            } else {
                break;
            }
        }

        let target = match less_or_eq {
            Some(less_or_eq) if empty_slot < less_or_eq => {
                for slot in empty_slot + 1..=less_or_eq {
                    self.move_record(slot, slot - 1);
                }
                less_or_eq
            }
            Some(less_or_eq) => {
                for slot in (less_or_eq + 1..empty_slot).rev() {
                    self.move_record(slot, slot + 1);
                }
                less_or_eq + 1
            }
            None => {
                for slot in (0..empty_slot).rev() {
                    self.move_record(slot, slot + 1);
                }
                0
            }
        };
        debug_assert!(!self.occupancy.get(target));
        tuple.set_record_id(Some(RecordId::new(self.pid, target)));
        self.tuples[target] = Some(tuple);
        self.occupancy.set(target);
        Ok(())
    }

    /// Delete the record identified by `rid`, leaving a gap. The remaining
    /// records keep their slots and record ids.
    pub fn delete_tuple(&mut self, rid: &RecordId) -> Result<()> {
        if rid.page_id != self.pid {
            return Err(DbError::invalid(format!(
                "record id {} does not belong to page {}",
                rid.page_id, self.pid
            )));
        }
        if rid.slot >= self.capacity || !self.occupancy.get(rid.slot) {
            return Err(DbError::invalid(format!(
                "slot {} on page {} is not in use",
                rid.slot, self.pid
            )));
        }
        self.remove_slot(rid.slot);
        Ok(())
    }

    pub(crate) fn remove_slot(&mut self, slot: usize) {
        self.tuples[slot] = None;
        self.occupancy.clear(slot);
    }

    pub fn parent_id(&self) -> BTreePageId {
        if self.parent == 0 {
            BTreePageId::new(self.pid.table_id, 0, PageCategory::RootPtr)
        } else {
            BTreePageId::new(self.pid.table_id, self.parent, PageCategory::Internal)
        }
    }

    pub fn set_parent_id(&mut self, parent: &BTreePageId) -> Result<()> {
        if parent.table_id != self.pid.table_id {
            return Err(DbError::invalid("parent page belongs to a different index"));
        }
        match parent.category {
            PageCategory::RootPtr => self.parent = 0,
            PageCategory::Internal => self.parent = parent.page_no,
            other => {
                return Err(DbError::invalid(format!(
                    "a leaf's parent must be the root pointer or an internal page, got {other}"
                )))
            }
        }
        Ok(())
    }

    pub fn left_sibling_id(&self) -> Option<BTreePageId> {
        if self.left == 0 {
            None
        } else {
            Some(BTreePageId::new(
                self.pid.table_id,
                self.left,
                PageCategory::Leaf,
            ))
        }
    }

    pub fn set_left_sibling_id(&mut self, left: Option<&BTreePageId>) -> Result<()> {
        self.left = Self::sibling_no(self.pid.table_id, left)?;
        Ok(())
    }

    pub fn right_sibling_id(&self) -> Option<BTreePageId> {
        if self.right == 0 {
            None
        } else {
            Some(BTreePageId::new(
                self.pid.table_id,
                self.right,
                PageCategory::Leaf,
            ))
        }
    }

    pub fn set_right_sibling_id(&mut self, right: Option<&BTreePageId>) -> Result<()> {
        self.right = Self::sibling_no(self.pid.table_id, right)?;
        Ok(())
    }

    fn sibling_no(table_id: u32, sibling: Option<&BTreePageId>) -> Result<usize> {
        match sibling {
            None => Ok(0),
            Some(pid) => {
                if pid.table_id != table_id {
                    return Err(DbError::invalid("sibling belongs to a different index"));
                }
                if pid.category != PageCategory::Leaf {
                    return Err(DbError::invalid(format!(
                        "a leaf's sibling must be a leaf page, got {}",
                        pid.category
                    )));
                }
                Ok(pid.page_no)
            }
        }
    }
}

impl std::fmt::Display for LeafPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== LeafPage {} ===", self.pid)?;
        writeln!(
            f,
            "parent: {}, left: {}, right: {}, used: {}/{}",
            self.parent,
            self.left,
            self.right,
            self.used_slots(),
            self.capacity
        )?;
        for slot in self.occupied_slots() {
            writeln!(f, "slot {}: {}", slot, self.tuples[slot].as_ref().unwrap())?;
        }
        writeln!(f, "====================")
    }
}

/// An internal page: m keys and m + 1 child pointers, stored as key slots
/// 1..=capacity plus child slots 0..=capacity. Slot 0 holds only a child
/// pointer. The child category tag records whether children are leaves or
/// internal pages; it is set by the first entry inserted.
#[derive(Debug, Clone)]
pub struct InternalPage {
    pid: BTreePageId,
    key_type: FieldType,
    page_size: usize,
    capacity: usize,
    parent: usize,
    child_category: Option<PageCategory>,
    occupancy: BitVec,
    keys: Vec<Option<Value>>,
    children: Vec<Option<usize>>,
}

impl InternalPage {
    pub fn new_empty(pid: BTreePageId, key_type: FieldType, page_size: usize) -> Self {
        let capacity = internal_capacity(page_size, key_type);
        Self {
            pid,
            key_type,
            page_size,
            capacity,
            parent: 0,
            child_category: None,
            occupancy: BitVec::new(capacity + 1),
            keys: vec![None; capacity + 1],
            children: vec![None; capacity + 1],
        }
    }

    pub fn from_bytes(
        pid: BTreePageId,
        key_type: FieldType,
        page_size: usize,
        data: &[u8],
    ) -> Result<Self> {
        debug_assert_eq!(data.len(), page_size);
        let capacity = internal_capacity(page_size, key_type);
        let parent = read_i32(data, 0);
        let child_category = match data[INT_BYTES] {
            0 => None,
            tag => {
                let category = PageCategory::from_u8(tag)?;
                if category != PageCategory::Leaf && category != PageCategory::Internal {
                    return Err(DbError::invalid(format!(
                        "child category must be leaf or internal, got {category}"
                    )));
                }
                Some(category)
            }
        };
        let bitmap_start = INT_BYTES + 1;
        let occupancy = BitVec::from_bytes(&data[bitmap_start..], capacity + 1);
        let keys_start = bitmap_start + bitmap_bytes(capacity + 1);
        let key_size = key_type.byte_size();
        let children_start = keys_start + capacity * key_size;

        let mut keys = vec![None; capacity + 1];
        let mut children = vec![None; capacity + 1];
        for slot in 0..=capacity {
            if occupancy.get(slot) {
                if slot > 0 {
                    let start = keys_start + (slot - 1) * key_size;
                    keys[slot] = Some(Value::read_from(&data[start..start + key_size], key_type)?);
                }
                let start = children_start + slot * INT_BYTES;
                children[slot] = Some(read_i32(data, start));
            }
        }
        let page = Self {
            pid,
            key_type,
            page_size,
            capacity,
            parent,
            child_category,
            occupancy,
            keys,
            children,
        };
        if page.used_entries() > 0 && page.child_category.is_none() {
            return Err(DbError::invalid(format!(
                "internal page {pid} has entries but no child category"
            )));
        }
        Ok(page)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.page_size];
        write_i32(&mut data, 0, self.parent);
        data[INT_BYTES] = self.child_category.map_or(0, |c| c as u8);
        let bitmap_start = INT_BYTES + 1;
        data[bitmap_start..bitmap_start + bitmap_bytes(self.capacity + 1)]
            .copy_from_slice(self.occupancy.as_bytes());
        let keys_start = bitmap_start + bitmap_bytes(self.capacity + 1);
        let key_size = self.key_type.byte_size();
        let children_start = keys_start + self.capacity * key_size;
        for slot in 0..=self.capacity {
            if self.occupancy.get(slot) {
                if slot > 0 {
                    let start = keys_start + (slot - 1) * key_size;
                    self.keys[slot]
                        .as_ref()
                        .unwrap()
                        .write_to(&mut data[start..start + key_size], self.key_type)?;
                }
                write_i32(
                    &mut data,
                    children_start + slot * INT_BYTES,
                    self.children[slot].unwrap(),
                );
            }
        }
        Ok(data)
    }

    pub fn id(&self) -> BTreePageId {
        self.pid
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn key_type(&self) -> FieldType {
        self.key_type
    }

    /// The number of entries (occupied key slots) on the page.
    pub fn used_entries(&self) -> usize {
        (1..=self.capacity)
            .filter(|&slot| self.occupancy.get(slot))
            .count()
    }

    pub fn empty_slots(&self) -> usize {
        self.capacity - self.used_entries()
    }

    pub fn child_category(&self) -> Option<PageCategory> {
        self.child_category
    }

    fn child_pid(&self, page_no: usize) -> BTreePageId {
        let category = self
            .child_category
            .expect("internal page with children must have a child category");
        BTreePageId::new(self.pid.table_id, page_no, category)
    }

    /// The entries on this page in key order. Adjacent entries share a
    /// child: each entry's left child is the previous entry's right child.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Entry> + '_ {
        let mut prev_child = if self.occupancy.get(0) {
            self.children[0]
        } else {
            None
        };
        let mut entries = Vec::new();
        for slot in 1..=self.capacity {
            if self.occupancy.get(slot) {
                let left = prev_child.expect("entry slot occupied without a left child");
                entries.push(Entry {
                    key: self.keys[slot].clone().unwrap(),
                    left_child: self.child_pid(left),
                    right_child: self.child_pid(self.children[slot].unwrap()),
                    slot: Some(slot),
                });
                prev_child = self.children[slot];
            }
        }
        entries.into_iter()
    }

    /// The child page ids in key order, including the leftmost child.
    pub fn children(&self) -> Vec<BTreePageId> {
        (0..=self.capacity)
            .filter(|&slot| self.occupancy.get(slot))
            .map(|slot| self.child_pid(self.children[slot].unwrap()))
            .collect()
    }

    /// The leftmost child of the page.
    pub fn first_child_id(&self) -> Result<BTreePageId> {
        if self.occupancy.get(0) {
            Ok(self.child_pid(self.children[0].unwrap()))
        } else {
            Err(DbError::invalid(format!(
                "internal page {} is empty",
                self.pid
            )))
        }
    }

    /// The rightmost child of the page.
    pub fn last_child_id(&self) -> Result<BTreePageId> {
        (0..=self.capacity)
            .rev()
            .find(|&slot| self.occupancy.get(slot))
            .map(|slot| self.child_pid(self.children[slot].unwrap()))
            .ok_or_else(|| DbError::invalid(format!("internal page {} is empty", self.pid)))
    }

    fn check_child(&mut self, child: &BTreePageId) -> Result<()> {
        if child.table_id != self.pid.table_id {
            return Err(DbError::invalid("child belongs to a different index"));
        }
        match self.child_category {
            None => {
                if child.category != PageCategory::Leaf && child.category != PageCategory::Internal
                {
                    return Err(DbError::invalid(format!(
                        "children must be leaf or internal pages, got {}",
                        child.category
                    )));
                }
                self.child_category = Some(child.category);
                Ok(())
            }
            Some(category) if category == child.category => Ok(()),
            Some(category) => Err(DbError::invalid(format!(
                "child category mismatch: page holds {category} children, entry has {}",
                child.category
            ))),
        }
    }

    fn move_entry(&mut self, from: usize, to: usize) {
        debug_assert!(from >= 1 && to >= 1);
        if self.occupancy.get(from) && !self.occupancy.get(to) {
            self.keys[to] = self.keys[from].take();
            self.children[to] = self.children[from].take();
            self.occupancy.clear(from);
            self.occupancy.set(to);
        }
    }

    /// Insert an entry in key order. One of the entry's children must
    /// already be on the page (they are adjacent in the tree); the matched
    /// child pointer is rewritten to the entry's left child and the key
    /// plus right child land in the freed position.
    pub fn insert_entry(&mut self, entry: Entry) -> Result<()> {
        self.check_child(&entry.left_child)?;
        self.check_child(&entry.right_child)?;

        //  the very first entry fills the reserved child slot 0 as well
        if self.used_entries() == 0 && !self.occupancy.get(0) {
            self.children[0] = Some(entry.left_child.page_no);
            self.occupancy.set(0);
            self.keys[1] = Some(entry.key);
            self.children[1] = Some(entry.right_child.page_no);
            self.occupancy.set(1);
            return Ok(());
        }

        let empty_slot = (1..=self.capacity)
            .find(|&slot| !self.occupancy.get(slot))
            .ok_or_else(|| {
                DbError::invalid(format!("no empty slots on internal page {}", self.pid))
            })?;

        //  find the child pointer matching the entry's left or right child
        let mut less_or_eq: Option<usize> = None;
        for slot in 0..=self.capacity {
            if !self.occupancy.get(slot) {
                continue;
            }
            let child = self.children[slot].unwrap();
            if child == entry.left_child.page_no || child == entry.right_child.page_no {
                if slot > 0 && self.keys[slot].as_ref().unwrap() > &entry.key {
                    return Err(DbError::invalid(format!(
                        "entry {} is out of order on internal page {}",
                        entry, self.pid
                    )));
                }
                less_or_eq = Some(slot);
                if child == entry.right_child.page_no {
                    self.children[slot] = Some(entry.left_child.page_no);
                }
            } else if less_or_eq.is_some() {
                break;
            }
        }
        let less_or_eq = less_or_eq.ok_or_else(|| {
            DbError::invalid(format!(
                "entry {} does not connect to any child of internal page {}",
                entry, self.pid
            ))
        })?;

        let target = if empty_slot < less_or_eq {
            for slot in empty_slot + 1..=less_or_eq {
                self.move_entry(slot, slot - 1);
            }
            less_or_eq
        } else {
            for slot in (less_or_eq + 1..empty_slot).rev() {
                self.move_entry(slot, slot + 1);
            }
            less_or_eq + 1
        };
        debug_assert!(!self.occupancy.get(target));
        self.keys[target] = Some(entry.key);
        self.children[target] = Some(entry.right_child.page_no);
        self.occupancy.set(target);
        Ok(())
    }

    /// Delete an entry together with its right child pointer. The entry
    /// must have been obtained from [`InternalPage::iter`].
    pub fn delete_key_and_right_child(&mut self, entry: &Entry) -> Result<()> {
        let slot = self.entry_slot(entry)?;
        self.keys[slot] = None;
        self.children[slot] = None;
        self.occupancy.clear(slot);
        Ok(())
    }

    /// Delete an entry together with its left child pointer: the entry's
    /// right child replaces the child pointer to its left.
    pub fn delete_key_and_left_child(&mut self, entry: &Entry) -> Result<()> {
        let slot = self.entry_slot(entry)?;
        let prev = (0..slot)
            .rev()
            .find(|&s| self.occupancy.get(s))
            .ok_or_else(|| {
                DbError::invalid(format!(
                    "entry at slot {slot} of page {} has no left child slot",
                    self.pid
                ))
            })?;
        self.children[prev] = self.children[slot].take();
        self.keys[slot] = None;
        self.occupancy.clear(slot);
        Ok(())
    }

    /// Rewrite the key and right child of an existing entry in place.
    pub fn update_entry(&mut self, entry: &Entry) -> Result<()> {
        let slot = self.entry_slot(entry)?;
        self.keys[slot] = Some(entry.key.clone());
        self.children[slot] = Some(entry.right_child.page_no);
        Ok(())
    }

    fn entry_slot(&self, entry: &Entry) -> Result<usize> {
        let slot = entry.slot().ok_or_else(|| {
            DbError::invalid("entry is not attached to a slot on this page".to_string())
        })?;
        if slot == 0 || slot > self.capacity || !self.occupancy.get(slot) {
            return Err(DbError::invalid(format!(
                "slot {slot} on internal page {} is not in use",
                self.pid
            )));
        }
        Ok(slot)
    }

    pub fn parent_id(&self) -> BTreePageId {
        if self.parent == 0 {
            BTreePageId::new(self.pid.table_id, 0, PageCategory::RootPtr)
        } else {
            BTreePageId::new(self.pid.table_id, self.parent, PageCategory::Internal)
        }
    }

    pub fn set_parent_id(&mut self, parent: &BTreePageId) -> Result<()> {
        if parent.table_id != self.pid.table_id {
            return Err(DbError::invalid("parent page belongs to a different index"));
        }
        match parent.category {
            PageCategory::RootPtr => self.parent = 0,
            PageCategory::Internal => self.parent = parent.page_no,
            other => {
                return Err(DbError::invalid(format!(
                    "an internal page's parent must be the root pointer or an internal page, got {other}"
                )))
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for InternalPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== InternalPage {} ===", self.pid)?;
        writeln!(
            f,
            "parent: {}, children: {:?}, used: {}/{}",
            self.parent,
            self.child_category,
            self.used_entries(),
            self.capacity
        )?;
        for entry in self.iter() {
            writeln!(f, "slot {}: {}", entry.slot().unwrap(), entry)?;
        }
        writeln!(f, "====================")
    }
}

/// A header page: one bit per page slot in the file's free list (set =
/// in use) plus prev/next pointers linking the header chain. Freshly
/// created header pages mark every slot used so pages the chain does not
/// yet track are never handed out.
#[derive(Debug, Clone)]
pub struct HeaderPage {
    pid: BTreePageId,
    page_size: usize,
    bitmap: BitVec,
    prev: usize,
    next: usize,
}

impl HeaderPage {
    pub fn new_empty(pid: BTreePageId, page_size: usize) -> Self {
        Self {
            pid,
            page_size,
            bitmap: BitVec::new(header_capacity(page_size)),
            prev: 0,
            next: 0,
        }
    }

    pub fn from_bytes(pid: BTreePageId, page_size: usize, data: &[u8]) -> Result<Self> {
        debug_assert_eq!(data.len(), page_size);
        let slots = header_capacity(page_size);
        let bitmap = BitVec::from_bytes(data, slots);
        let pointers_start = bitmap_bytes(slots);
        let prev = read_i32(data, pointers_start);
        let next = read_i32(data, pointers_start + INT_BYTES);
        Ok(Self {
            pid,
            page_size,
            bitmap,
            prev,
            next,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.page_size];
        let pointers_start = bitmap_bytes(self.bitmap.len());
        data[..pointers_start].copy_from_slice(self.bitmap.as_bytes());
        write_i32(&mut data, pointers_start, self.prev);
        write_i32(&mut data, pointers_start + INT_BYTES, self.next);
        data
    }

    pub fn id(&self) -> BTreePageId {
        self.pid
    }

    pub fn num_slots(&self) -> usize {
        self.bitmap.len()
    }

    pub fn first_empty_slot(&self) -> Option<usize> {
        self.bitmap.first_clear()
    }

    pub fn slot_in_use(&self, slot: usize) -> bool {
        self.bitmap.get(slot)
    }

    pub fn mark_slot_used(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.bitmap.set(slot);
        Ok(())
    }

    pub fn mark_slot_free(&mut self, slot: usize) -> Result<()> {
        self.check_slot(slot)?;
        self.bitmap.clear(slot);
        Ok(())
    }

    pub fn mark_all_used(&mut self) {
        self.bitmap.set_all();
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.bitmap.len() {
            return Err(DbError::invalid(format!(
                "slot {slot} is out of range for header page {}",
                self.pid
            )));
        }
        Ok(())
    }

    pub fn prev_id(&self) -> Option<BTreePageId> {
        if self.prev == 0 {
            None
        } else {
            Some(BTreePageId::new(
                self.pid.table_id,
                self.prev,
                PageCategory::Header,
            ))
        }
    }

    pub fn set_prev_id(&mut self, prev: Option<&BTreePageId>) {
        self.prev = prev.map_or(0, |pid| pid.page_no);
    }

    pub fn next_id(&self) -> Option<BTreePageId> {
        if self.next == 0 {
            None
        } else {
            Some(BTreePageId::new(
                self.pid.table_id,
                self.next,
                PageCategory::Header,
            ))
        }
    }

    pub fn set_next_id(&mut self, next: Option<&BTreePageId>) {
        self.next = next.map_or(0, |pid| pid.page_no);
    }
}

/// The four page kinds as a closed enum; everything that handles a page
/// matches on this exhaustively.
#[derive(Debug, Clone)]
pub enum BTreePage {
    RootPtr(RootPtrPage),
    Internal(InternalPage),
    Leaf(LeafPage),
    Header(HeaderPage),
}

impl BTreePage {
    pub fn id(&self) -> BTreePageId {
        match self {
            BTreePage::RootPtr(p) => p.id(),
            BTreePage::Internal(p) => p.id(),
            BTreePage::Leaf(p) => p.id(),
            BTreePage::Header(p) => p.id(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            BTreePage::RootPtr(p) => Ok(p.to_bytes()),
            BTreePage::Internal(p) => p.to_bytes(),
            BTreePage::Leaf(p) => p.to_bytes(),
            BTreePage::Header(p) => Ok(p.to_bytes()),
        }
    }

    /// The parent of a leaf or internal page.
    pub fn parent_id(&self) -> Result<BTreePageId> {
        match self {
            BTreePage::Leaf(p) => Ok(p.parent_id()),
            BTreePage::Internal(p) => Ok(p.parent_id()),
            other => Err(DbError::invalid(format!(
                "page {} has no parent pointer",
                other.id()
            ))),
        }
    }

    pub fn set_parent_id(&mut self, parent: &BTreePageId) -> Result<()> {
        match self {
            BTreePage::Leaf(p) => p.set_parent_id(parent),
            BTreePage::Internal(p) => p.set_parent_id(parent),
            other => Err(DbError::invalid(format!(
                "page {} has no parent pointer",
                other.id()
            ))),
        }
    }

    pub fn empty_slots(&self) -> Result<usize> {
        match self {
            BTreePage::Leaf(p) => Ok(p.empty_slots()),
            BTreePage::Internal(p) => Ok(p.empty_slots()),
            other => Err(DbError::invalid(format!(
                "page {} has no record slots",
                other.id()
            ))),
        }
    }

    pub fn as_leaf(&self) -> Result<&LeafPage> {
        match self {
            BTreePage::Leaf(p) => Ok(p),
            other => Err(DbError::invalid(format!(
                "expected a leaf page, found {}",
                other.id()
            ))),
        }
    }

    pub fn as_leaf_mut(&mut self) -> Result<&mut LeafPage> {
        match self {
            BTreePage::Leaf(p) => Ok(p),
            other => Err(DbError::invalid(format!(
                "expected a leaf page, found {}",
                other.id()
            ))),
        }
    }

    pub fn as_internal(&self) -> Result<&InternalPage> {
        match self {
            BTreePage::Internal(p) => Ok(p),
            other => Err(DbError::invalid(format!(
                "expected an internal page, found {}",
                other.id()
            ))),
        }
    }

    pub fn as_internal_mut(&mut self) -> Result<&mut InternalPage> {
        match self {
            BTreePage::Internal(p) => Ok(p),
            other => Err(DbError::invalid(format!(
                "expected an internal page, found {}",
                other.id()
            ))),
        }
    }

    pub fn as_header(&self) -> Result<&HeaderPage> {
        match self {
            BTreePage::Header(p) => Ok(p),
            other => Err(DbError::invalid(format!(
                "expected a header page, found {}",
                other.id()
            ))),
        }
    }

    pub fn as_header_mut(&mut self) -> Result<&mut HeaderPage> {
        match self {
            BTreePage::Header(p) => Ok(p),
            other => Err(DbError::invalid(format!(
                "expected a header page, found {}",
                other.id()
            ))),
        }
    }

    pub fn as_root_ptr(&self) -> Result<&RootPtrPage> {
        match self {
            BTreePage::RootPtr(p) => Ok(p),
            other => Err(DbError::invalid(format!(
                "expected the root pointer page, found {}",
                other.id()
            ))),
        }
    }

    pub fn as_root_ptr_mut(&mut self) -> Result<&mut RootPtrPage> {
        match self {
            BTreePage::RootPtr(p) => Ok(p),
            other => Err(DbError::invalid(format!(
                "expected the root pointer page, found {}",
                other.id()
            ))),
        }
    }
}

#[cfg(test)]
mod bitvec_tests {
    use super::*;

    #[test]
    fn test_set_clear_and_count() {
        let mut bits = BitVec::new(10);
        assert_eq!(bits.count_set(), 0);
        bits.set(0);
        bits.set(9);
        assert!(bits.get(0));
        assert!(bits.get(9));
        assert!(!bits.get(5));
        assert_eq!(bits.count_set(), 2);
        bits.clear(0);
        assert_eq!(bits.count_set(), 1);
        assert_eq!(bits.first_clear(), Some(0));
    }

    #[test]
    fn test_round_trip() {
        let mut bits = BitVec::new(10);
        bits.set(3);
        bits.set(8);
        let restored = BitVec::from_bytes(bits.as_bytes(), 10);
        assert_eq!(restored, bits);
    }

    #[test]
    fn test_set_all() {
        let mut bits = BitVec::new(13);
        bits.set_all();
        assert_eq!(bits.count_set(), 13);
        assert_eq!(bits.first_clear(), None);
    }
}

#[cfg(test)]
mod leaf_page_tests {
    use super::*;

    const PAGE_SIZE: usize = 64;

    fn test_layout() -> Layout {
        Layout::new(vec![FieldType::Int, FieldType::Int])
    }

    fn test_leaf() -> LeafPage {
        let pid = BTreePageId::new(1, 1, PageCategory::Leaf);
        LeafPage::new_empty(pid, test_layout(), 0, PAGE_SIZE)
    }

    fn tuple(key: i32) -> Tuple {
        Tuple::new(vec![Value::Int(key), Value::Int(key * 10)])
    }

    #[test]
    fn test_capacity_fits_page() {
        let layout = test_layout();
        let capacity = leaf_capacity(PAGE_SIZE, &layout);
        assert!(capacity >= 4);
        assert!(3 * 4 + bitmap_bytes(capacity) + capacity * layout.tuple_size() <= PAGE_SIZE);
    }

    #[test]
    fn test_insert_keeps_sorted_order() {
        let mut leaf = test_leaf();
        for key in [30, 10, 20, 40] {
            leaf.insert_tuple(tuple(key)).unwrap();
        }
        let keys: Vec<_> = leaf.iter().map(|t| t.value(0).clone()).collect();
        assert_eq!(
            keys,
            vec![
                Value::Int(10),
                Value::Int(20),
                Value::Int(30),
                Value::Int(40)
            ]
        );
    }

    #[test]
    fn test_delete_leaves_gap_and_insert_reuses_it() {
        let mut leaf = test_leaf();
        for key in [10, 20, 30] {
            leaf.insert_tuple(tuple(key)).unwrap();
        }
        let rid = leaf.tuple_at(1).unwrap().record_id().unwrap();
        leaf.delete_tuple(&rid).unwrap();
        assert_eq!(leaf.used_slots(), 2);
        assert!(leaf.tuple_at(1).is_none());

        //  the surviving records kept their slots
        assert_eq!(leaf.tuple_at(0).unwrap().value(0), &Value::Int(10));
        assert_eq!(leaf.tuple_at(2).unwrap().value(0), &Value::Int(30));

        leaf.insert_tuple(tuple(25)).unwrap();
        let keys: Vec<_> = leaf.iter().map(|t| t.value(0).clone()).collect();
        assert_eq!(keys, vec![Value::Int(10), Value::Int(25), Value::Int(30)]);
    }

    #[test]
    fn test_shifted_records_update_their_record_ids() {
        let mut leaf = test_leaf();
        for key in [10, 30, 40] {
            leaf.insert_tuple(tuple(key)).unwrap();
        }
        //  free slot 0, then insert a key that belongs between 30 and 40
        let rid = leaf.tuple_at(0).unwrap().record_id().unwrap();
        leaf.delete_tuple(&rid).unwrap();
        leaf.insert_tuple(tuple(35)).unwrap();
        for slot in leaf.occupied_slots().collect::<Vec<_>>() {
            let rid = leaf.tuple_at(slot).unwrap().record_id().unwrap();
            assert_eq!(rid.slot, slot);
            assert_eq!(rid.page_id, leaf.id());
        }
    }

    #[test]
    fn test_insert_into_full_page_fails() {
        let mut leaf = test_leaf();
        for key in 0..leaf.capacity() as i32 {
            leaf.insert_tuple(tuple(key)).unwrap();
        }
        assert!(leaf.insert_tuple(tuple(100)).is_err());
    }

    #[test]
    fn test_round_trip() {
        let mut leaf = test_leaf();
        for key in [10, 20, 30] {
            leaf.insert_tuple(tuple(key)).unwrap();
        }
        let rid = leaf.tuple_at(1).unwrap().record_id().unwrap();
        leaf.delete_tuple(&rid).unwrap();
        leaf.set_parent_id(&BTreePageId::new(1, 7, PageCategory::Internal))
            .unwrap();
        leaf.set_right_sibling_id(Some(&BTreePageId::new(1, 2, PageCategory::Leaf)))
            .unwrap();

        let bytes = leaf.to_bytes().unwrap();
        assert_eq!(bytes.len(), PAGE_SIZE);
        let restored =
            LeafPage::from_bytes(leaf.id(), test_layout(), 0, PAGE_SIZE, &bytes).unwrap();
        assert_eq!(restored.to_bytes().unwrap(), bytes);
        assert_eq!(restored.used_slots(), 2);
        assert_eq!(restored.parent_id(), leaf.parent_id());
        assert_eq!(restored.right_sibling_id(), leaf.right_sibling_id());
        assert!(restored.tuple_at(1).is_none());
        assert_eq!(
            restored.tuple_at(0).unwrap().record_id().unwrap(),
            RecordId::new(leaf.id(), 0)
        );
    }
}



#[cfg(test)]
mod root_ptr_page_tests {
    use super::*;

    #[test]
    fn test_empty_root_ptr() {
        let pid = BTreePageId::new(1, 0, PageCategory::RootPtr);
        let page = RootPtrPage::from_bytes(pid, &[0u8; ROOT_PTR_PAGE_SIZE]).unwrap();
        assert_eq!(page.root_id(), None);
        assert_eq!(page.header_id(), None);
    }

    #[test]
    fn test_round_trip() {
        let pid = BTreePageId::new(1, 0, PageCategory::RootPtr);
        let mut page = RootPtrPage::new_empty(pid);
        page.set_root_id(&BTreePageId::new(1, 4, PageCategory::Internal))
            .unwrap();
        page.set_header_id(Some(&BTreePageId::new(1, 2, PageCategory::Header)))
            .unwrap();
        let bytes = page.to_bytes();
        assert_eq!(bytes.len(), ROOT_PTR_PAGE_SIZE);
        let restored = RootPtrPage::from_bytes(pid, &bytes).unwrap();
        assert_eq!(restored.to_bytes(), bytes);
        assert_eq!(
            restored.root_id().unwrap(),
            BTreePageId::new(1, 4, PageCategory::Internal)
        );
        assert_eq!(restored.header_id().unwrap().page_no, 2);
    }

    #[test]
    fn test_rejects_header_as_root() {
        let pid = BTreePageId::new(1, 0, PageCategory::RootPtr);
        let mut page = RootPtrPage::new_empty(pid);
        let result = page.set_root_id(&BTreePageId::new(1, 4, PageCategory::Header));
        assert!(result.is_err());
    }
}
