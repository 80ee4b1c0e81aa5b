//! The module containing the NPT/EPT manager described below.
//!
//! Builds and mutates second-level page tables for one VM, generalizing
//! `rhv`'s `Vm::build_translation`/`walk_table` (which only ever built 4 KiB,
//! read-execute leaves for its copy-on-write fuzzing isolation) into the full
//! `set_mapping`/unmap contract: arbitrary present/write/execute attributes,
//! page-size selection, and split-on-demand for huge pages.

use crate::status::{NsvResult, NsvStatus};
use alloc::boxed::Box;
use core::ptr::addr_of;

/// Guest-physical page size an [`Mapping`] may request (mirrors `noir_cvm_mapping_attributes.psize`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageSize {
    /// 4 KiB.
    Size4K = 0,
    /// 2 MiB.
    Size2M = 1,
    /// 1 GiB.
    Size1G = 2,
}

impl PageSize {
    /// The number of nested-paging levels below this size's own level; i.e.
    /// how many `9`-bit index chunks remain below a leaf at this size.
    const fn leaf_depth(self) -> u32 {
        match self {
            PageSize::Size4K => 0,
            PageSize::Size2M => 1,
            PageSize::Size1G => 2,
        }
    }
}

bitfield::bitfield! {
    /// `noir_cvm_mapping_attributes`: `present:1 | write:1 | user:1 |
    /// execute:1 | psize:2 | avl:3`.
    #[derive(Clone, Copy)]
    pub struct MappingAttributes(u32);
    impl Debug;
    u8;
    pub present, set_present: 0, 0;
    pub write, set_write: 1, 1;
    pub user, set_user: 2, 2;
    pub execute, set_execute: 3, 3;
    pub psize_raw, set_psize_raw: 5, 4;
    pub avl, set_avl: 8, 6;
}

impl MappingAttributes {
    /// Builds the attribute set for a plain present/write/execute mapping
    /// at the given page size.
    #[must_use]
    pub fn new(present: bool, write: bool, execute: bool, psize: PageSize) -> Self {
        let mut attrs = Self(0);
        attrs.set_present(u8::from(present));
        attrs.set_write(u8::from(write));
        attrs.set_execute(u8::from(execute));
        attrs.set_psize_raw(psize as u8);
        attrs
    }

    /// The attribute set for an unmap request: "Unmap uses the same
    /// structure with all permission bits cleared".
    #[must_use]
    pub fn unmap(psize: PageSize) -> Self {
        Self::new(false, false, false, psize)
    }

    /// True when this attribute set requests any access at all; false means
    /// "unmap".
    #[must_use]
    pub fn requests_mapping(&self) -> bool {
        self.present() != 0 || self.write() != 0 || self.execute() != 0
    }

    /// Decoded page size.
    #[must_use]
    pub fn psize(&self) -> PageSize {
        match self.psize_raw() {
            1 => PageSize::Size2M,
            2 => PageSize::Size1G,
            _ => PageSize::Size4K,
        }
    }
}

/// The permission/memory-type pair a vendor back-end derives from
/// [`MappingAttributes`] to program into a raw nested-paging entry (vendor
/// encodings of "permission" and "memory type" differ between SVM and VMX;
/// see `hardware_vt`).
#[derive(Clone, Copy, Debug)]
pub struct NestedEntryFlags {
    /// Vendor-specific permission bits (RWX).
    pub permission: u8,
    /// Vendor-specific memory-type bits (e.g. write-back).
    pub memory_type: u8,
}

bitfield::bitfield! {
    /// A single nested/extended page-table entry. Generalized from `rhv`'s
    /// `NestedPagingStructureEntry` with an explicit `large` bit so PD/PDPT
    /// levels can terminate as 2 MiB/1 GiB leaves instead of always
    /// descending to a 4 KiB PT.
    #[derive(Clone, Copy)]
    pub struct NestedPagingStructureEntry(u64);
    impl Debug;
    u8;
    pub permission, set_permission: 2, 0;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7, 7;
    u64;
    pub pfn, set_pfn: 58, 12;
}

const PAGE_SHIFT: u32 = 12;
const ENTRIES_PER_TABLE: usize = 512;

impl NestedPagingStructureEntry {
    fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn set_translation(&mut self, pfn: u64, flags: NestedEntryFlags, large: bool) {
        self.set_pfn(pfn);
        self.set_permission(flags.permission);
        self.set_memory_type(flags.memory_type);
        self.set_large(u8::from(large));
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

/// One page-sized nested-paging table: 512 entries, usable as a PML4, PDPT,
/// PD, or PT node.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct NestedPagingStructure {
    /// The 512 entries of this table.
    pub entries: [NestedPagingStructureEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<NestedPagingStructure>() == 0x1000);

impl Default for NestedPagingStructure {
    fn default() -> Self {
        Self { entries: [NestedPagingStructureEntry(0); ENTRIES_PER_TABLE] }
    }
}

/// Builds and mutates the nested/extended page tables for one VM.
///
/// Owns a preallocated pool of [`NestedPagingStructure`] nodes (generalized
/// from `rhv`'s fixed `nested_paging_structures` pool) that `set_mapping`
/// consumes as it lazily materializes PDPT/PD/PT levels on the way to a
/// leaf.
pub struct NptManager {
    pml4: Box<NestedPagingStructure>,
    pool: Box<[NestedPagingStructure]>,
    used: usize,
}

impl NptManager {
    /// Creates a manager with an empty PML4 and a pool of `pool_size`
    /// preallocated nodes to satisfy future table-level allocations.
    #[must_use]
    pub fn new(pool_size: usize) -> Self {
        Self {
            pml4: Box::new(NestedPagingStructure::default()),
            pool: alloc::vec![NestedPagingStructure::default(); pool_size].into_boxed_slice(),
            used: 0,
        }
    }

    /// The host-physical (here: identity, since the pool is a plain `Box`)
    /// address of the PML4, as handed to the vendor back-end's
    /// `initialize`.
    #[must_use]
    pub fn pml4_addr(&self) -> u64 {
        addr_of!(*self.pml4) as u64
    }

    fn index(gpa: u64, level: u32) -> usize {
        let shift = PAGE_SHIFT + level * 9;
        ((gpa >> shift) & 0x1FF) as usize
    }

    /// Returns the child table an entry points to, allocating and linking
    /// one from the pool first if the entry is currently empty. If the
    /// entry is instead a huge-page leaf left over from an earlier, coarser
    /// mapping, demotes it first via [`Self::split_leaf`] so a
    /// finer-grained mapping can overlap it without reinterpreting the
    /// leaf's host frame number as a table address.
    ///
    /// Mirrors `rhv`'s `walk_table`: `table` is reached through a raw
    /// pointer (see `map_page`) so its lifetime `'a` is independent of
    /// `&mut self`, letting this be called repeatedly down a tree level
    /// without the borrow checker treating each call as aliasing the
    /// previous one.
    fn child_table<'a>(
        &mut self,
        table: &'a mut NestedPagingStructure,
        index: usize,
        child_level: u32,
        rwx_flags: NestedEntryFlags,
    ) -> NsvResult<&'a mut NestedPagingStructure> {
        let entry = &mut table.entries[index];
        if entry.is_empty() {
            if self.used >= self.pool.len() {
                return Err(NsvStatus::INSUFFICIENT_RESOURCES);
            }
            let addr = addr_of!(self.pool[self.used]) as u64;
            self.used += 1;
            entry.set_translation(addr >> PAGE_SHIFT, rwx_flags, false);
        } else if entry.large() != 0 {
            Self::split_leaf(&mut self.pool, &mut self.used, entry, child_level, rwx_flags)?;
        }
        let table_addr = (entry.pfn() << PAGE_SHIFT) as *mut NestedPagingStructure;
        // SAFETY: `table_addr` was either just derived from a slot inside
        // `self.pool`, or was derived the same way on a previous call;
        // `self.pool` is never reallocated or moved after construction, so
        // the pointer stays valid for the manager's lifetime.
        Ok(unsafe { &mut *table_addr })
    }

    /// Demotes a huge-page leaf `entry` into an intermediate entry pointing
    /// at a freshly allocated child table of `child_level`-sized leaves,
    /// each inheriting `entry`'s permission/memory-type and a pfn offset by
    /// its position within the original region. `entry` itself becomes a
    /// plain (fully permissive) intermediate entry, matching every other
    /// non-leaf entry `child_table` creates.
    fn split_leaf(
        pool: &mut [NestedPagingStructure],
        used: &mut usize,
        entry: &mut NestedPagingStructureEntry,
        child_level: u32,
        rwx_flags: NestedEntryFlags,
    ) -> NsvResult<()> {
        if *used >= pool.len() {
            return Err(NsvStatus::INSUFFICIENT_RESOURCES);
        }
        let addr = addr_of!(pool[*used]) as u64;
        *used += 1;
        let parent_pfn = entry.pfn();
        let inherited_flags = NestedEntryFlags { permission: entry.permission(), memory_type: entry.memory_type() };
        let pages_per_child = 1u64 << (9 * child_level);
        // SAFETY: `addr` was just derived from a slot inside `pool` that no
        // other live reference aliases (`*used` was only just advanced past
        // it).
        let child_table = unsafe { &mut *(addr as *mut NestedPagingStructure) };
        for (i, child_entry) in child_table.entries.iter_mut().enumerate() {
            let sub_pfn = parent_pfn + (i as u64) * pages_per_child;
            child_entry.set_translation(sub_pfn, inherited_flags, child_level > 0);
        }
        entry.set_translation(addr >> PAGE_SHIFT, rwx_flags, false);
        Ok(())
    }

    /// Installs (or removes) the nested-paging translation for one
    /// guest-physical page to `host_frame` (a host-physical frame number)
    /// with `attrs`. `rwx_flags` is the vendor-specific encoding for a
    /// plain intermediate (fully permissive) table-walk entry, and
    /// `leaf_flags` is the vendor-specific encoding matching `attrs` for the
    /// terminal leaf, both computed by the caller via the active
    /// `HardwareVt::nps_entry_flags`.
    ///
    /// # Errors
    /// [`NsvStatus::INSUFFICIENT_RESOURCES`] if the preallocated table pool
    /// is exhausted while materializing intermediate levels.
    pub fn map_page(
        &mut self,
        gpa: u64,
        host_frame: u64,
        attrs: MappingAttributes,
        rwx_flags: NestedEntryFlags,
        leaf_flags: NestedEntryFlags,
    ) -> NsvResult<()> {
        let leaf_depth = attrs.psize().leaf_depth();
        let pml4_ptr: *mut NestedPagingStructure = self.pml4.as_mut();
        // SAFETY: `pml4_ptr` is derived from `self.pml4`, which outlives
        // this call; going through a raw pointer detaches the reference's
        // lifetime from `&mut self` so the loop below can re-borrow `self`
        // on each iteration.
        let mut table: &mut NestedPagingStructure = unsafe { &mut *pml4_ptr };
        // Walk from PML4 (level 3) down to one level above the leaf.
        for level in (leaf_depth + 1..=3).rev() {
            let index = Self::index(gpa, level);
            table = self.child_table(table, index, level - 1, rwx_flags)?;
        }
        let index = Self::index(gpa, leaf_depth);
        let entry = &mut table.entries[index];
        if attrs.requests_mapping() {
            entry.set_translation(host_frame, leaf_flags, leaf_depth > 0);
        } else {
            entry.clear();
        }
        Ok(())
    }

    /// Looks up the current leaf entry's permission bits for `gpa` at page
    /// size `psize`, if a translation has been built for it. Used by tests
    /// and by the mapping-round-trip testable property.
    #[must_use]
    pub fn translation(&self, gpa: u64, psize: PageSize) -> Option<NestedPagingStructureEntry> {
        let leaf_depth = psize.leaf_depth();
        let mut table: &NestedPagingStructure = &self.pml4;
        for level in (leaf_depth + 1..=3).rev() {
            let index = Self::index(gpa, level);
            let entry = table.entries[index];
            if entry.is_empty() {
                return None;
            }
            let table_addr = (entry.pfn() << PAGE_SHIFT) as *const NestedPagingStructure;
            // SAFETY: see `child_table`; every non-empty intermediate entry
            // was linked to a node inside `self.pool`.
            table = unsafe { &*table_addr };
        }
        let index = Self::index(gpa, leaf_depth);
        let entry = table.entries[index];
        if entry.is_empty() {
            None
        } else {
            Some(entry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RWX: NestedEntryFlags = NestedEntryFlags { permission: 0b111, memory_type: 6 };
    const RX: NestedEntryFlags = NestedEntryFlags { permission: 0b101, memory_type: 6 };

    #[test]
    fn mapping_round_trips_at_4kib() {
        let mut npt = NptManager::new(16);
        let attrs = MappingAttributes::new(true, true, true, PageSize::Size4K);
        npt.map_page(0x10000, 0x77, attrs, RWX, RWX).unwrap();
        let entry = npt.translation(0x10000, PageSize::Size4K).unwrap();
        assert_eq!(entry.pfn(), 0x77);
        assert_eq!(entry.permission(), 0b111);
    }

    #[test]
    fn unmap_clears_the_leaf() {
        let mut npt = NptManager::new(16);
        let attrs = MappingAttributes::new(true, true, true, PageSize::Size4K);
        npt.map_page(0x10000, 0x77, attrs, RWX, RWX).unwrap();
        npt.map_page(0x10000, 0, MappingAttributes::unmap(PageSize::Size4K), RWX, RX).unwrap();
        assert!(npt.translation(0x10000, PageSize::Size4K).is_none());
    }

    #[test]
    fn large_page_terminates_above_the_pt_level() {
        let mut npt = NptManager::new(16);
        let attrs = MappingAttributes::new(true, true, false, PageSize::Size2M);
        npt.map_page(0x20_0000, 0x123, attrs, RWX, RX).unwrap();
        let entry = npt.translation(0x20_0000, PageSize::Size2M).unwrap();
        assert_eq!(entry.large(), 1);
        assert_eq!(entry.pfn(), 0x123);
    }

    #[test]
    fn a_finer_mapping_demotes_an_overlapping_huge_page() {
        let mut npt = NptManager::new(32);
        let huge = MappingAttributes::new(true, true, false, PageSize::Size2M);
        npt.map_page(0x20_0000, 0x123, huge, RWX, RX).unwrap();

        let small = MappingAttributes::new(true, true, true, PageSize::Size4K);
        // One page, 16 frames (0x10 in pfn units) into the 2 MiB region.
        npt.map_page(0x20_0000 + 0x10000, 0x123 + 0x10, small, RWX, RWX).unwrap();

        let demoted = npt.translation(0x20_0000 + 0x10000, PageSize::Size4K).unwrap();
        assert_eq!(demoted.large(), 0);
        assert_eq!(demoted.pfn(), 0x133);
        assert_eq!(demoted.permission(), 0b111);

        // A sibling 4 KiB page within the same demoted region still carries
        // the original huge page's permission/frame, just split finer.
        let sibling = npt.translation(0x20_0000, PageSize::Size4K).unwrap();
        assert_eq!(sibling.pfn(), 0x123);
        assert_eq!(sibling.permission(), 0b101);
    }

    #[test]
    fn pool_exhaustion_is_reported_not_panicked() {
        let mut npt = NptManager::new(1);
        let attrs = MappingAttributes::new(true, true, true, PageSize::Size4K);
        // The first mapping consumes PDPT+PD+PT = 3 nodes from a pool of 1.
        let err = npt.map_page(0x10000, 1, attrs, RWX, RWX).unwrap_err();
        assert_eq!(err, NsvStatus::INSUFFICIENT_RESOURCES);
    }
}
