use std::collections::HashMap;

use tracing::debug;

use crate::error::{DbError, Result};
use crate::file::IndexFile;
use crate::page::{
    internal_capacity, leaf_capacity, BTreePage, BTreePageId, Entry, InternalPage, LeafPage,
    PageCategory, RootPtrPage,
};
use crate::types::{Tuple, Value};

/// Build a tree from already-sorted input, packing leaves full instead of
/// splitting them half-empty the way incremental inserts would. Input must
/// be sorted ascending on the key field; the file must be empty.
///
/// This writes through the file directly, so it must run before the file
/// is registered with a buffer pool. Pages are written bottom-up and the
/// root pointer last.
///
/// Returns the number of records loaded.
pub fn bulk_load(
    file: &IndexFile,
    tuples: impl IntoIterator<Item = Tuple>,
) -> Result<usize> {
    if file.num_pages()? != 0 {
        return Err(DbError::invalid("bulk load requires an empty index file"));
    }
    let layout = file.layout().clone();
    let key_field = file.key_field();
    let key_type = file.key_type();
    let page_size = file.page_size();
    let table_id = file.table_id();
    let leaf_cap = leaf_capacity(page_size, &layout);

    //  chunk the input into full leaves, verifying sortedness on the way
    let mut chunks: Vec<Vec<Tuple>> = Vec::new();
    let mut prev_key: Option<Value> = None;
    let mut total = 0usize;
    for mut tuple in tuples {
        layout.check_tuple(&tuple)?;
        tuple.set_record_id(None);
        let key = tuple.value(key_field).clone();
        if let Some(prev) = &prev_key {
            if &key < prev {
                return Err(DbError::invalid(format!(
                    "bulk load input is not sorted: {key} after {prev}"
                )));
            }
        }
        prev_key = Some(key);
        match chunks.last_mut() {
            Some(chunk) if chunk.len() < leaf_cap => chunk.push(tuple),
            _ => chunks.push(vec![tuple]),
        }
        total += 1;
    }
    if chunks.is_empty() {
        return Ok(0);
    }

    //  an underfull final leaf borrows from the one before it
    if chunks.len() >= 2 && chunks.last().unwrap().len() < leaf_cap / 2 {
        let last = chunks.pop().unwrap();
        let mut combined = chunks.pop().unwrap();
        combined.extend(last);
        let keep = combined.len() - combined.len() / 2;
        let tail = combined.split_off(keep);
        chunks.push(combined);
        chunks.push(tail);
    }

    let mut pages: HashMap<usize, BTreePage> = HashMap::new();
    let mut next_page_no = 1usize;

    //  build the leaf level: pages 1..=L, chained left to right
    let num_leaves = chunks.len();
    let mut level: Vec<usize> = Vec::new();
    let mut separators: Vec<Value> = Vec::new();
    let mut level_category = PageCategory::Leaf;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let page_no = next_page_no;
        next_page_no += 1;
        let pid = BTreePageId::new(table_id, page_no, PageCategory::Leaf);
        let mut leaf = LeafPage::new_empty(pid, layout.clone(), key_field, page_size);
        if i > 0 {
            separators.push(chunk[0].value(key_field).clone());
            let left = BTreePageId::new(table_id, page_no - 1, PageCategory::Leaf);
            leaf.set_left_sibling_id(Some(&left))?;
        }
        if i + 1 < num_leaves {
            let right = BTreePageId::new(table_id, page_no + 1, PageCategory::Leaf);
            leaf.set_right_sibling_id(Some(&right))?;
        }
        for tuple in chunk {
            leaf.insert_tuple(tuple)?;
        }
        pages.insert(page_no, BTreePage::Leaf(leaf));
        level.push(page_no);
    }

    //  build internal levels until one page covers everything; between
    //  adjacent pages of a level one separator is pushed up to the next
    while level.len() > 1 {
        let full = internal_cap_children(internal_capacity(page_size, key_type));
        let mut sizes: Vec<usize> = Vec::new();
        let mut remaining = level.len();
        while remaining > full {
            sizes.push(full);
            remaining -= full;
        }
        sizes.push(remaining);
        //  an underfull final page borrows children from the one before it
        if sizes.len() >= 2 {
            let last = *sizes.last().unwrap();
            if last - 1 < internal_capacity(page_size, key_type) / 2 {
                let combined = full + last;
                let keep = combined - combined / 2;
                let n = sizes.len();
                sizes[n - 2] = keep;
                sizes[n - 1] = combined - keep;
            }
        }

        let mut next_level = Vec::new();
        let mut next_separators = Vec::new();
        let mut idx = 0usize;
        let pages_in_level = sizes.len();
        for (p, group) in sizes.into_iter().enumerate() {
            let page_no = next_page_no;
            next_page_no += 1;
            let pid = BTreePageId::new(table_id, page_no, PageCategory::Internal);
            let mut page = InternalPage::new_empty(pid, key_type, page_size);
            for j in 0..group - 1 {
                let left = BTreePageId::new(table_id, level[idx + j], level_category);
                let right = BTreePageId::new(table_id, level[idx + j + 1], level_category);
                page.insert_entry(Entry::new(separators[idx + j].clone(), left, right))?;
            }
            for j in 0..group {
                pages
                    .get_mut(&level[idx + j])
                    .unwrap()
                    .set_parent_id(&pid)?;
            }
            if p + 1 < pages_in_level {
                next_separators.push(separators[idx + group - 1].clone());
            }
            idx += group;
            pages.insert(page_no, BTreePage::Internal(page));
            next_level.push(page_no);
        }
        level = next_level;
        separators = next_separators;
        level_category = PageCategory::Internal;
    }

    //  write data pages first, the root pointer last
    let mut page_nos: Vec<usize> = pages.keys().copied().collect();
    page_nos.sort_unstable();
    for page_no in page_nos {
        file.write_page(&pages[&page_no])?;
    }
    let root_pid = BTreePageId::new(table_id, level[0], level_category);
    let root_ptr_pid = BTreePageId::new(table_id, 0, PageCategory::RootPtr);
    let mut root_ptr = RootPtrPage::new_empty(root_ptr_pid);
    root_ptr.set_root_id(&root_pid)?;
    file.write_page(&BTreePage::RootPtr(root_ptr))?;
    debug!(table_id, records = total, pages = next_page_no - 1, "bulk loaded index");
    Ok(total)
}

/// The most children one internal page can take.
fn internal_cap_children(capacity: usize) -> usize {
    capacity + 1
}
