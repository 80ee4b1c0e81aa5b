//! MMIO and port-I/O region registries.
//!
//! The source keeps one AVL tree per VM for registered MMIO ranges and
//! another for registered PIO ranges, so a trapped access can be resolved to
//! its owner in `O(log n)`. `alloc::collections::BTreeMap` already gives us
//! a balanced, ordered tree with the same complexity and range-query
//! support, so it stands in for the hand-rolled AVL tree rather than
//! reimplementing tree-balancing from scratch (see DESIGN.md).

use alloc::collections::BTreeMap;
use core::ops::Range;

/// A callback invoked when a trapped access falls inside a registered range.
///
/// `offset` is the access's position relative to the region's start;
/// `value` carries the write value in and the read result out. Returns
/// `false` if the access could not be serviced (caller should report an
/// exit rather than resuming the guest).
pub type AccessHandler = alloc::boxed::Box<dyn FnMut(u64, u8, bool, &mut u64) -> bool + Send>;

/// One registered range and the callback servicing it.
struct Region {
    end: u64,
    handler: AccessHandler,
}

/// A registry of non-overlapping address ranges (guest-physical for MMIO,
/// port numbers for PIO), each bound to a handler.
#[derive(Default)]
pub struct RegionRegistry {
    regions: BTreeMap<u64, Region>,
}

impl RegionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { regions: BTreeMap::new() }
    }

    /// Registers `range` with `handler`. Returns `false` without mutating
    /// the registry if `range` overlaps an already-registered one.
    pub fn register(&mut self, range: Range<u64>, handler: AccessHandler) -> bool {
        if self.overlaps(&range) {
            return false;
        }
        self.regions.insert(range.start, Region { end: range.end, handler });
        true
    }

    /// Removes the region that starts exactly at `start`, if any.
    pub fn unregister(&mut self, start: u64) -> bool {
        self.regions.remove(&start).is_some()
    }

    fn overlaps(&self, range: &Range<u64>) -> bool {
        self.regions
            .range(..range.end)
            .next_back()
            .is_some_and(|(_, region)| region.end > range.start)
    }

    /// Finds the region containing `address`, if one is registered.
    fn locate(&self, address: u64) -> Option<u64> {
        let start = *self.regions.range(..=address).next_back()?.0;
        let region = self.regions.get(&start)?;
        (address < region.end).then_some(start)
    }

    /// Dispatches a `size`-byte access at `address` to whichever region(s)
    /// claim it. `*value` carries the write operand in or the read result
    /// out. Returns `false` if no region claims `address` at all.
    ///
    /// An access that crosses out of the region it started in is split at
    /// the boundary: the prefix that fits is serviced by this region, and
    /// the remainder is dispatched again starting at the boundary (which
    /// may land in an adjacent region, or in none). A read's two halves are
    /// recomposed into one value through a scratch buffer; a write's value
    /// is split the same way before each half is handed to its region. The
    /// whole access reports success only if every sub-dispatch does.
    pub fn dispatch(&mut self, address: u64, size: u8, write: bool, value: &mut u64) -> bool {
        let Some(start) = self.locate(address) else { return false };
        let available = self.regions[&start].end - address;
        if u64::from(size) <= available {
            let region = self.regions.get_mut(&start).expect("just located");
            return (region.handler)(address - start, size, write, value);
        }

        let first_size = available as u8;
        let second_size = size - first_size;
        if write {
            let mut first_value = mask_low(*value, first_size);
            let first_ok = {
                let region = self.regions.get_mut(&start).expect("just located");
                (region.handler)(address - start, first_size, true, &mut first_value)
            };
            let mut second_value = *value >> (u32::from(first_size) * 8);
            let second_ok =
                self.dispatch(address + u64::from(first_size), second_size, true, &mut second_value);
            first_ok && second_ok
        } else {
            let mut first_value = 0u64;
            let first_ok = {
                let region = self.regions.get_mut(&start).expect("just located");
                (region.handler)(address - start, first_size, false, &mut first_value)
            };
            let mut second_value = 0u64;
            let second_ok =
                self.dispatch(address + u64::from(first_size), second_size, false, &mut second_value);
            *value = mask_low(first_value, first_size)
                | (mask_low(second_value, second_size) << (u32::from(first_size) * 8));
            first_ok && second_ok
        }
    }
}

fn mask_low(value: u64, bytes: u8) -> u64 {
    if bytes >= 8 {
        value
    } else {
        value & ((1u64 << (u32::from(bytes) * 8)) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use spin::Mutex;
    use alloc::sync::Arc;

    #[test]
    fn dispatch_resolves_to_the_owning_region() {
        let mut registry = RegionRegistry::new();
        let seen = Arc::new(Mutex::new(0u64));
        let seen_clone = seen.clone();
        registry.register(
            0x1000..0x2000,
            Box::new(move |offset, _size, write, value| {
                if write {
                    *seen_clone.lock() = offset;
                } else {
                    *value = 0x42;
                }
                true
            }),
        );
        let mut value = 0xaa;
        assert!(registry.dispatch(0x1010, 4, true, &mut value));
        assert_eq!(*seen.lock(), 0x10);
        assert!(registry.dispatch(0x1020, 4, false, &mut value));
        assert_eq!(value, 0x42);
    }

    #[test]
    fn dispatch_misses_unregistered_addresses() {
        let mut registry = RegionRegistry::new();
        registry.register(0x1000..0x2000, Box::new(|_, _, _, _| true));
        let mut value = 0;
        assert!(!registry.dispatch(0x5000, 4, false, &mut value));
    }

    #[test]
    fn overlapping_registration_is_rejected() {
        let mut registry = RegionRegistry::new();
        assert!(registry.register(0x1000..0x2000, Box::new(|_, _, _, _| true)));
        assert!(!registry.register(0x1800..0x2800, Box::new(|_, _, _, _| true)));
        assert!(registry.register(0x2000..0x3000, Box::new(|_, _, _, _| true)));
    }

    #[test]
    fn access_spanning_into_unclaimed_space_is_rejected() {
        let mut registry = RegionRegistry::new();
        registry.register(0x1000..0x1008, Box::new(|_, _, _, _| true));
        let mut value = 0;
        assert!(!registry.dispatch(0x1004, 8, false, &mut value));
    }

    #[test]
    fn an_unaligned_read_spanning_two_regions_is_recomposed() {
        let mut registry = RegionRegistry::new();
        registry.register(
            0x1000..0x1008,
            Box::new(|_, _, write, value| {
                if !write {
                    *value = 0xAABB_CCDD;
                }
                true
            }),
        );
        registry.register(
            0x1008..0x1010,
            Box::new(|_, _, write, value| {
                if !write {
                    *value = 0x1122_3344;
                }
                true
            }),
        );
        let mut value = 0;
        assert!(registry.dispatch(0x1004, 8, false, &mut value));
        assert_eq!(value, 0x1122_3344_AABB_CCDD);
    }

    #[test]
    fn an_unaligned_write_spanning_two_regions_splits_the_value() {
        let mut registry = RegionRegistry::new();
        let first_seen = Arc::new(Mutex::new(0u64));
        let second_seen = Arc::new(Mutex::new(0u64));
        let first_clone = first_seen.clone();
        let second_clone = second_seen.clone();
        registry.register(
            0x1000..0x1008,
            Box::new(move |_, _, write, value| {
                if write {
                    *first_clone.lock() = *value;
                }
                true
            }),
        );
        registry.register(
            0x1008..0x1010,
            Box::new(move |_, _, write, value| {
                if write {
                    *second_clone.lock() = *value;
                }
                true
            }),
        );
        let mut value = 0x1122_3344_AABB_CCDD;
        assert!(registry.dispatch(0x1004, 8, true, &mut value));
        assert_eq!(*first_seen.lock(), 0xAABB_CCDD);
        assert_eq!(*second_seen.lock(), 0x1122_3344);
    }

    #[test]
    fn unregister_frees_the_range_for_reuse() {
        let mut registry = RegionRegistry::new();
        registry.register(0x1000..0x2000, Box::new(|_, _, _, _| true));
        assert!(registry.unregister(0x1000));
        assert!(registry.register(0x1000..0x2000, Box::new(|_, _, _, _| true)));
    }
}
