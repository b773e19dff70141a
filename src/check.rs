use std::collections::HashSet;

use crate::btree::{max_empty_slots, BTreeFile};
use crate::buffer::Permission;
use crate::error::{DbError, Result};
use crate::page::{BTreePageId, PageCategory};
use crate::transaction::Transaction;
use crate::types::Value;

/// Walk the whole tree and verify its structural invariants: every child
/// points back at its parent, keys respect the bounds inherited from
/// ancestor separators, entries and records are sorted, every leaf sits
/// at the same depth, and the leaf sibling chain matches the tree's
/// left-to-right leaf order.
///
/// With `check_occupancy` set, every page other than the root must also
/// hold at least floor((capacity - 1) / 2) records or entries, the load
/// the splits and rebalancing deletes guarantee. That only holds for
/// completed operations, not mid-operation, so it is opt-in.
pub fn check_tree(index: &BTreeFile, tx: &Transaction, check_occupancy: bool) -> Result<()> {
    let root_ptr_pid = BTreePageId::new(index.table_id(), 0, PageCategory::RootPtr);
    let root = {
        let arc = tx.get_page(&root_ptr_pid, Permission::ReadOnly)?;
        let guard = arc.lock().unwrap();
        guard.as_root_ptr()?.root_id()
    };
    let root = match root {
        Some(root) => root,
        None => return Ok(()),
    };
    let mut checker = TreeChecker {
        tx,
        check_occupancy,
        root,
        leaves: Vec::new(),
        visited: HashSet::new(),
    };
    checker.check_page(root, root_ptr_pid, None, None)?;
    checker.check_leaf_chain()
}

struct LeafInfo {
    pid: BTreePageId,
    left: Option<BTreePageId>,
    right: Option<BTreePageId>,
}

struct TreeChecker<'a> {
    tx: &'a Transaction,
    check_occupancy: bool,
    root: BTreePageId,
    //  leaves in tree left-to-right order, for the chain check
    leaves: Vec<LeafInfo>,
    visited: HashSet<BTreePageId>,
}

impl TreeChecker<'_> {
    /// Check the subtree rooted at `pid` and return its leaf depth.
    fn check_page(
        &mut self,
        pid: BTreePageId,
        expected_parent: BTreePageId,
        lower: Option<Value>,
        upper: Option<Value>,
    ) -> Result<usize> {
        if !self.visited.insert(pid) {
            return Err(fail(format!("page {pid} is reachable twice")));
        }
        match pid.category {
            PageCategory::Leaf => self.check_leaf(pid, expected_parent, lower, upper),
            PageCategory::Internal => self.check_internal(pid, expected_parent, lower, upper),
            other => Err(fail(format!(
                "page of category {other} is linked into the tree at {pid}"
            ))),
        }
    }

    fn check_leaf(
        &mut self,
        pid: BTreePageId,
        expected_parent: BTreePageId,
        lower: Option<Value>,
        upper: Option<Value>,
    ) -> Result<usize> {
        let arc = self.tx.get_page(&pid, Permission::ReadOnly)?;
        let guard = arc.lock().unwrap();
        let leaf = guard.as_leaf()?;

        if leaf.parent_id() != expected_parent {
            return Err(fail(format!(
                "leaf {pid} has parent {}, expected {expected_parent}",
                leaf.parent_id()
            )));
        }
        if leaf.used_slots() == 0 && pid != self.root {
            return Err(fail(format!("non-root leaf {pid} is empty")));
        }
        if self.check_occupancy
            && pid != self.root
            && leaf.empty_slots() > max_empty_slots(leaf.capacity())
        {
            return Err(fail(format!("leaf {pid} is below minimum occupancy")));
        }

        let mut prev: Option<Value> = None;
        for tuple in leaf.iter() {
            let key = tuple.value(leaf.key_field());
            check_bounds(&pid, key, lower.as_ref(), upper.as_ref())?;
            if let Some(prev) = &prev {
                if key < prev {
                    return Err(fail(format!("leaf {pid} records are out of order")));
                }
            }
            let rid = tuple
                .record_id()
                .ok_or_else(|| fail(format!("leaf {pid} holds a record with no record id")))?;
            if rid.page_id != pid {
                return Err(fail(format!(
                    "record in leaf {pid} carries record id for {}",
                    rid.page_id
                )));
            }
            prev = Some(key.clone());
        }

        self.leaves.push(LeafInfo {
            pid,
            left: leaf.left_sibling_id(),
            right: leaf.right_sibling_id(),
        });
        Ok(1)
    }

    fn check_internal(
        &mut self,
        pid: BTreePageId,
        expected_parent: BTreePageId,
        lower: Option<Value>,
        upper: Option<Value>,
    ) -> Result<usize> {
        let (entries, children) = {
            let arc = self.tx.get_page(&pid, Permission::ReadOnly)?;
            let guard = arc.lock().unwrap();
            let internal = guard.as_internal()?;

            if internal.parent_id() != expected_parent {
                return Err(fail(format!(
                    "internal page {pid} has parent {}, expected {expected_parent}",
                    internal.parent_id()
                )));
            }
            if internal.used_entries() == 0 {
                return Err(fail(format!("internal page {pid} has no entries")));
            }
            if self.check_occupancy
                && pid != self.root
                && internal.empty_slots() > max_empty_slots(internal.capacity())
            {
                return Err(fail(format!(
                    "internal page {pid} is below minimum occupancy"
                )));
            }

            let entries: Vec<Value> = internal.iter().map(|e| e.key().clone()).collect();
            (entries, internal.children())
        };

        let mut prev: Option<&Value> = None;
        for key in &entries {
            check_bounds(&pid, key, lower.as_ref(), upper.as_ref())?;
            if let Some(prev) = prev {
                if key < prev {
                    return Err(fail(format!("internal page {pid} entries are out of order")));
                }
            }
            prev = Some(key);
        }

        //  child i sits between entry i-1 and entry i; duplicates make the
        //  separator bounds inclusive on both sides
        let mut depth = None;
        for (i, child) in children.iter().enumerate() {
            let child_lower = if i == 0 {
                lower.clone()
            } else {
                Some(entries[i - 1].clone())
            };
            let child_upper = if i == entries.len() {
                upper.clone()
            } else {
                Some(entries[i].clone())
            };
            let child_depth = self.check_page(*child, pid, child_lower, child_upper)?;
            match depth {
                None => depth = Some(child_depth),
                Some(depth) if depth != child_depth => {
                    return Err(fail(format!(
                        "children of {pid} sit at different depths ({depth} vs {child_depth})"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(depth.unwrap() + 1)
    }

    /// The sibling pointers must stitch the leaves together in exactly
    /// the order the tree walk visited them.
    fn check_leaf_chain(&self) -> Result<()> {
        for (i, leaf) in self.leaves.iter().enumerate() {
            let expected_left = if i == 0 {
                None
            } else {
                Some(self.leaves[i - 1].pid)
            };
            let expected_right = self.leaves.get(i + 1).map(|l| l.pid);
            if leaf.left != expected_left {
                return Err(fail(format!(
                    "leaf {} left sibling is {:?}, expected {expected_left:?}",
                    leaf.pid, leaf.left
                )));
            }
            if leaf.right != expected_right {
                return Err(fail(format!(
                    "leaf {} right sibling is {:?}, expected {expected_right:?}",
                    leaf.pid, leaf.right
                )));
            }
        }
        Ok(())
    }
}

fn check_bounds(
    pid: &BTreePageId,
    key: &Value,
    lower: Option<&Value>,
    upper: Option<&Value>,
) -> Result<()> {
    if let Some(lower) = lower {
        if key < lower {
            return Err(fail(format!("key {key} in {pid} is below its lower bound {lower}")));
        }
    }
    if let Some(upper) = upper {
        if key > upper {
            return Err(fail(format!("key {key} in {pid} is above its upper bound {upper}")));
        }
    }
    Ok(())
}

fn fail(msg: String) -> DbError {
    DbError::invalid(msg)
}
