//! The module containing [`HandleTable`], the multi-level handle tree
//! described below.
//!
//! Translates an opaque 64-bit handle (as seen by an untrusted user-mode VM
//! manager) into an internal object in bounded time. Objects are stored as
//! `Arc<T>` so `reference` can hand the caller a strong clone without
//! holding the table's lock: lookups take a read lock, insert/free take a
//! write lock.

use crate::config::{HANDLE_TABLE_FAN_OUT, HANDLE_TABLE_INDEX_BITS};
use crate::status::{NsvResult, NsvStatus};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

/// One node of the handle tree: a page-sized array of slots. A slot is
/// either empty, a leaf object, or (at non-zero levels) a pointer to the
/// next-level node.
enum Node<T> {
    Leaf(Vec<Option<Arc<T>>>),
    Branch(Vec<Option<Box<Node<T>>>>),
}

impl<T> Node<T> {
    fn new_leaf() -> Self {
        Node::Leaf(vec_of_none(HANDLE_TABLE_FAN_OUT))
    }

    fn new_branch() -> Self {
        Node::Branch((0..HANDLE_TABLE_FAN_OUT).map(|_| None).collect())
    }
}

fn vec_of_none<T>(len: usize) -> Vec<Option<Arc<T>>> {
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(None);
    }
    v
}

/// Multi-level handle table. Level 0 is always a [`Node::Leaf`]; levels above
/// it are [`Node::Branch`]. The handle's low bits (in [`HANDLE_TABLE_INDEX_BITS`]
/// chunks) index into the tree from the root down to the leaf.
pub struct HandleTable<T> {
    inner: RwLock<Inner<T>>,
}

struct Inner<T> {
    root: Box<Node<T>>,
    /// Number of levels above the leaf (0 means the root is itself the leaf).
    levels: u32,
    /// One past the highest handle ever minted; bounds the reaper's walk.
    high_water_mark: u64,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    /// Creates an empty handle table with a single leaf level.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                root: Box::new(Node::new_leaf()),
                levels: 0,
                high_water_mark: 0,
            }),
        }
    }

    /// Inserts `obj`, returning the handle it was placed under.
    ///
    /// Walks the tree under the exclusive lock; if every leaf is full, the
    /// tree grows by one level (the previous root becomes the first child
    /// of a new root),
    ///
    /// # Errors
    /// Returns [`NsvStatus::INSUFFICIENT_RESOURCES`] only in the
    /// (practically unreachable) case the handle space itself is exhausted.
    pub fn create_handle(&self, obj: Arc<T>) -> NsvResult<u64> {
        let mut inner = self.inner.write();
        loop {
            if let Some(handle) = try_insert(&mut inner.root, inner.levels, obj.clone()) {
                if handle + 1 > inner.high_water_mark {
                    inner.high_water_mark = handle + 1;
                }
                return Ok(handle);
            }
            grow(&mut inner)?;
        }
    }

    /// Resolves `handle` to a strong reference, or `None` if the handle is
    /// unused, stale, or out of range. Takes only the shared lock.
    #[must_use]
    pub fn reference(&self, handle: u64) -> Option<Arc<T>> {
        let inner = self.inner.read();
        lookup(&inner.root, inner.levels, handle)
    }

    /// Clears the slot for `handle`. A no-op if the handle is already empty
    /// or out of range; the tree is never shrunk ("Frees are
    /// lazy; tree is not shrunk").
    pub fn delete_handle(&self, handle: u64) {
        let mut inner = self.inner.write();
        let levels = inner.levels;
        clear(&mut inner.root, levels, handle);
    }

    /// Walks every live handle up to the high-water mark under the
    /// exclusive lock, invoking `should_reap` on each live object; objects
    /// for which it returns `true` are cleared from the table. Used to
    /// release every VM/vCPU handle owned by a process that exits without
    /// an explicit `release_vm`.
    pub fn reap<F: FnMut(&Arc<T>) -> bool>(&self, mut should_reap: F) {
        let mut inner = self.inner.write();
        let high_water_mark = inner.high_water_mark;
        reap_node(&mut inner.root, inner.levels, high_water_mark, 0, &mut should_reap);
    }
}

fn index_at_level(handle: u64, level: u32) -> usize {
    let shift = level * HANDLE_TABLE_INDEX_BITS;
    ((handle >> shift) & (HANDLE_TABLE_FAN_OUT as u64 - 1)) as usize
}

fn try_insert<T>(node: &mut Node<T>, level: u32, obj: Arc<T>) -> Option<u64> {
    match node {
        Node::Leaf(slots) => {
            for (i, slot) in slots.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(obj);
                    return Some(i as u64);
                }
            }
            None
        }
        Node::Branch(children) => {
            for (i, child) in children.iter_mut().enumerate() {
                let child_node =
                    child.get_or_insert_with(|| Box::new(new_node_for_level(level - 1)));
                if let Some(sub_handle) = try_insert(child_node, level - 1, obj.clone()) {
                    let shift = level * HANDLE_TABLE_INDEX_BITS;
                    return Some(((i as u64) << shift) | sub_handle);
                }
            }
            None
        }
    }
}

fn new_node_for_level<T>(level: u32) -> Node<T> {
    if level == 0 {
        Node::new_leaf()
    } else {
        Node::new_branch()
    }
}

fn lookup<T>(node: &Node<T>, level: u32, handle: u64) -> Option<Arc<T>> {
    let index = index_at_level(handle, level);
    if index >= HANDLE_TABLE_FAN_OUT {
        return None;
    }
    match node {
        Node::Leaf(slots) => slots.get(index).and_then(Clone::clone),
        Node::Branch(children) => {
            let child = children.get(index)?.as_ref()?;
            lookup(child, level - 1, handle)
        }
    }
}

fn clear<T>(node: &mut Node<T>, level: u32, handle: u64) {
    let index = index_at_level(handle, level);
    if index >= HANDLE_TABLE_FAN_OUT {
        return;
    }
    match node {
        Node::Leaf(slots) => {
            if let Some(slot) = slots.get_mut(index) {
                *slot = None;
            }
        }
        Node::Branch(children) => {
            if let Some(Some(child)) = children.get_mut(index) {
                clear(child, level - 1, handle);
            }
        }
    }
}

fn reap_node<T, F: FnMut(&Arc<T>) -> bool>(
    node: &mut Node<T>,
    level: u32,
    high_water_mark: u64,
    base_handle: u64,
    should_reap: &mut F,
) {
    match node {
        Node::Leaf(slots) => {
            for (i, slot) in slots.iter_mut().enumerate() {
                let handle = base_handle | (i as u64);
                if handle >= high_water_mark {
                    break;
                }
                if let Some(obj) = slot {
                    if should_reap(obj) {
                        *slot = None;
                    }
                }
            }
        }
        Node::Branch(children) => {
            let shift = level * HANDLE_TABLE_INDEX_BITS;
            for (i, child) in children.iter_mut().enumerate() {
                let child_base = base_handle | ((i as u64) << shift);
                if child_base >= high_water_mark {
                    break;
                }
                if let Some(child_node) = child {
                    reap_node(child_node, level - 1, high_water_mark, child_base, should_reap);
                }
            }
        }
    }
}

fn grow<T>(inner: &mut Inner<T>) -> NsvResult<()> {
    if inner.levels >= MAX_LEVELS {
        return Err(NsvStatus::INSUFFICIENT_RESOURCES);
    }
    let mut new_root = Node::new_branch();
    if let Node::Branch(children) = &mut new_root {
        let old_root = core::mem::replace(&mut inner.root, Box::new(Node::new_leaf()));
        children[0] = Some(old_root);
    }
    inner.root = Box::new(new_root);
    inner.levels += 1;
    Ok(())
}

/// Bounds handle-space growth to 64 bits worth of index chunks.
const MAX_LEVELS: u32 = 64 / HANDLE_TABLE_INDEX_BITS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trip() {
        let table: HandleTable<u32> = HandleTable::new();
        let handle = table.create_handle(Arc::new(42)).unwrap();
        assert_eq!(table.reference(handle).as_deref(), Some(&42));
        table.delete_handle(handle);
        assert!(table.reference(handle).is_none());
    }

    #[test]
    fn unknown_handle_resolves_to_none() {
        let table: HandleTable<u32> = HandleTable::new();
        assert!(table.reference(0xdead_beef).is_none());
    }

    #[test]
    fn deleting_unknown_handle_is_a_no_op() {
        let table: HandleTable<u32> = HandleTable::new();
        table.delete_handle(12345);
    }

    #[test]
    fn grows_across_a_level_boundary() {
        let table: HandleTable<u32> = HandleTable::new();
        let mut handles = Vec::new();
        for i in 0..600u32 {
            handles.push(table.create_handle(Arc::new(i)).unwrap());
        }
        assert_eq!(table.reference(handles[0]).as_deref(), Some(&0));
        assert_eq!(table.reference(handles[512]).as_deref(), Some(&512));
        assert_eq!(table.reference(handles[599]).as_deref(), Some(&599));
    }

    #[test]
    fn reaper_clears_matching_objects_only() {
        let table: HandleTable<(u32, u32)> = HandleTable::new();
        let pid1 = table.create_handle(Arc::new((1, 10))).unwrap();
        let pid2 = table.create_handle(Arc::new((2, 20))).unwrap();
        table.reap(|obj| obj.0 == 1);
        assert!(table.reference(pid1).is_none());
        assert_eq!(table.reference(pid2).as_deref(), Some(&(2, 20)));
    }
}
