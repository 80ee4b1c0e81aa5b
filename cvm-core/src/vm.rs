//! The module containing [`Vm`], the per-virtual-machine object.
//!
//! Generalizes `rhv`'s single hard-coded `Vm` (one `HardwareVt`, a fixed
//! nested-paging pool, copy-on-write dirty pages) into a CVM: an ASID, an
//! arbitrary number of [`Vcpu`]s referenced by stable index, and one or more
//! independently-mapped NPT/EPT address spaces a vCPU can be bound to
//! (`CreateVm2`'s extra "mapping sets", selected per vCPU by
//! `SetVcpuVmMap`/`GetVcpuVmMap`).

use crate::hardware_vt::HardwareVt;
use crate::mmio::{AccessHandler, RegionRegistry};
use crate::npt::{MappingAttributes, NptManager};
use crate::status::{NsvResult, NsvStatus};
use crate::vcpu::Vcpu;
use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, RwLock};

const PAGE_SHIFT: u32 = 12;

/// One pinned batch of host-physical frames backing a `LockMemory` locker
/// entry. The platform driver resolves `hva`'s page-table frames and hands
/// them in already pinned; this registry only lets `set_mapping` reference
/// them by locker id and index instead of trusting a raw, unchecked host
/// frame number (see DESIGN.md).
struct LockerEntry {
    #[allow(dead_code)]
    hva: u64,
    host_frames: Vec<u64>,
}

/// One region `set_mapping` has carved out, tracked only so
/// [`crate::config::MEMORY_BLOCK_LIMIT_PER_VM`] bounds something real.
#[derive(Clone, Copy)]
struct MemoryBlockEntry {
    #[allow(dead_code)]
    mapping_id: u32,
    #[allow(dead_code)]
    gpa: u64,
}

/// A virtual machine: one or more NPT/EPT address spaces ("mapping sets"),
/// each shared by whichever [`Vcpu`]s are currently bound to it, the
/// accessed-page tracking `QueryGpaAdMap`/`ClearGpaAdBits` expose, the
/// locker list `LockMemory`/`UnlockMemory` pin host pages into, and the
/// MMIO/PIO region registries `run_vcpu`'s caller dispatches a decoded
/// access through.
pub struct Vm {
    asid: u32,
    mappings: RwLock<Vec<NptManager>>,
    vcpus: RwLock<Vec<Option<Arc<Vcpu>>>>,
    vcpu_mapping_id: RwLock<Vec<u32>>,
    accessed_pages: RwLock<BTreeSet<u64>>,
    lockers: RwLock<Vec<Option<LockerEntry>>>,
    memory_blocks: RwLock<Vec<MemoryBlockEntry>>,
    mmio: Mutex<RegionRegistry>,
    pio: Mutex<RegionRegistry>,
    /// Runs currently in flight against one of this VM's vCPUs, plus the
    /// live vCPU count: `release_vm` refuses to delete the handle while
    /// either is nonzero.
    in_flight_runs: AtomicU32,
}

impl Vm {
    /// Creates a VM with `asid` and a single empty mapping set (id `0`)
    /// backed by a pool of `nps_pool_size` preallocated table nodes.
    #[must_use]
    pub fn new(asid: u32, nps_pool_size: usize) -> Self {
        Self {
            asid,
            mappings: RwLock::new(alloc::vec![NptManager::new(nps_pool_size)]),
            vcpus: RwLock::new(Vec::new()),
            vcpu_mapping_id: RwLock::new(Vec::new()),
            accessed_pages: RwLock::new(BTreeSet::new()),
            lockers: RwLock::new(Vec::new()),
            memory_blocks: RwLock::new(Vec::new()),
            mmio: Mutex::new(RegionRegistry::new()),
            pio: Mutex::new(RegionRegistry::new()),
            in_flight_runs: AtomicU32::new(0),
        }
    }

    /// Marks one `run_vcpu` call against this VM as in flight; paired with
    /// [`Self::end_run`] around every call into [`Vcpu::run`].
    pub fn begin_run(&self) {
        self.in_flight_runs.fetch_add(1, Ordering::AcqRel);
    }

    /// The matching end of [`Self::begin_run`].
    pub fn end_run(&self) {
        self.in_flight_runs.fetch_sub(1, Ordering::AcqRel);
    }

    /// True if this VM still owns a vCPU, or a `run_vcpu` against one of
    /// them is in flight; `release_vm` must not delete the handle while
    /// this holds.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight_runs.load(Ordering::Acquire) != 0 || !self.vcpus().is_empty()
    }

    /// This VM's address-space-ID.
    #[must_use]
    pub fn asid(&self) -> u32 {
        self.asid
    }

    /// `CreateVm2`: adds another independent mapping set, returning its id.
    pub fn add_mapping_set(&self, nps_pool_size: usize) -> u32 {
        let mut mappings = self.mappings.write();
        mappings.push(NptManager::new(nps_pool_size));
        (mappings.len() - 1) as u32
    }

    fn pml4_addr(&self, mapping_id: u32) -> NsvResult<u64> {
        self.mappings
            .read()
            .get(mapping_id as usize)
            .map(NptManager::pml4_addr)
            .ok_or(NsvStatus::INVALID_PARAMETER)
    }

    /// Creates vCPU `index`, backed by `vt`, bound to mapping set `0`.
    /// Grows the vCPU list if needed.
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_ALREADY_CREATED`] if `index` already names a live
    /// vCPU in this VM.
    pub fn create_vcpu(&self, index: u32, vt: Box<dyn HardwareVt + Send>) -> NsvResult<Arc<Vcpu>> {
        let mut vcpus = self.vcpus.write();
        let index_usize = index as usize;
        if index_usize < vcpus.len() && vcpus[index_usize].is_some() {
            return Err(NsvStatus::VCPU_ALREADY_CREATED);
        }
        if index_usize >= vcpus.len() {
            vcpus.resize(index_usize + 1, None);
            self.vcpu_mapping_id.write().resize(index_usize + 1, 0);
        }
        let vcpu = Arc::new(Vcpu::new(index, vt, self.pml4_addr(0)?));
        vcpus[index_usize] = Some(vcpu.clone());
        Ok(vcpu)
    }

    /// Resolves vCPU `index`, if it was created and not yet released.
    #[must_use]
    pub fn vcpu(&self, index: u32) -> Option<Arc<Vcpu>> {
        self.vcpus.read().get(index as usize)?.clone()
    }

    /// Releases vCPU `index`; a no-op if it does not exist.
    pub fn release_vcpu(&self, index: u32) {
        let mut vcpus = self.vcpus.write();
        if let Some(slot) = vcpus.get_mut(index as usize) {
            *slot = None;
        }
    }

    /// `GetVcpuVmMap`: the mapping-set id vCPU `index` is currently bound to.
    #[must_use]
    pub fn vcpu_mapping_id(&self, index: u32) -> Option<u32> {
        self.vcpu_mapping_id.read().get(index as usize).copied()
    }

    /// `SetVcpuVmMap`: rebinds vCPU `index` to mapping set `mapping_id`,
    /// reprogramming its nested-paging root.
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_NOT_EXIST`] if `index` names no live vCPU;
    /// [`NsvStatus::INVALID_PARAMETER`] if `mapping_id` is out of range.
    pub fn set_vcpu_mapping_id(&self, index: u32, mapping_id: u32) -> NsvResult<()> {
        let vcpu = self.vcpu(index).ok_or(NsvStatus::VCPU_NOT_EXIST)?;
        let pml4_addr = self.pml4_addr(mapping_id)?;
        vcpu.rebind_nested_paging(pml4_addr);
        if let Some(slot) = self.vcpu_mapping_id.write().get_mut(index as usize) {
            *slot = mapping_id;
        }
        Ok(())
    }

    /// `LockMemory`: registers a locker entry pinning `host_frames` (already
    /// resolved and pinned by the platform driver from `hva`), returning
    /// the locker id `set_mapping` references by index.
    ///
    /// # Errors
    /// [`NsvStatus::INSUFFICIENT_RESOURCES`] if the VM already has
    /// [`crate::config::LOCKER_LIST_LIMIT_PER_VM`] live lockers.
    pub fn lock_memory(&self, hva: u64, host_frames: Vec<u64>) -> NsvResult<u32> {
        let mut lockers = self.lockers.write();
        let live = lockers.iter().filter(|l| l.is_some()).count();
        if live >= crate::config::LOCKER_LIST_LIMIT_PER_VM {
            return Err(NsvStatus::INSUFFICIENT_RESOURCES);
        }
        let id = lockers.len() as u32;
        lockers.push(Some(LockerEntry { hva, host_frames }));
        Ok(id)
    }

    /// `UnlockMemory`: releases locker `id`.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `id` names no live locker.
    pub fn unlock_memory(&self, id: u32) -> NsvResult<()> {
        let mut lockers = self.lockers.write();
        let slot = lockers.get_mut(id as usize).ok_or(NsvStatus::INVALID_PARAMETER)?;
        if slot.is_none() {
            return Err(NsvStatus::INVALID_PARAMETER);
        }
        *slot = None;
        Ok(())
    }

    /// `SetMapping`/`SetMapping2`: installs or removes the guest-physical-
    /// to-host-physical translation for one page within mapping set
    /// `mapping_id`. The host frame comes from locker `locker_id`'s pinned
    /// batch at `page_in_locker` rather than a caller-supplied raw frame
    /// number, so every mapped page is backed by a page the platform driver
    /// actually pinned first. `vt` supplies the vendor-specific leaf and
    /// intermediate-table permission encodings; every vCPU currently bound
    /// to that mapping set then has its nested-paging TLB invalidated.
    /// Ignored for an unmap request (`attrs` requests no access), which
    /// needs no locker at all.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `mapping_id` is out of range, or
    /// `locker_id`/`page_in_locker` names no pinned frame for a mapping
    /// request; [`NsvStatus::INSUFFICIENT_RESOURCES`] if the VM already has
    /// [`crate::config::MEMORY_BLOCK_LIMIT_PER_VM`] tracked regions;
    /// [`NsvStatus::UNINITIALIZED`] if the VM has no vCPU yet (a vendor
    /// backend is needed to translate `attrs` into entry flags).
    /// See also [`NptManager::map_page`].
    pub fn set_mapping(
        &self,
        mapping_id: u32,
        gpa: u64,
        locker_id: u32,
        page_in_locker: u32,
        attrs: MappingAttributes,
    ) -> NsvResult<()> {
        let host_frame = if attrs.requests_mapping() {
            let lockers = self.lockers.read();
            let locker =
                lockers.get(locker_id as usize).and_then(Option::as_ref).ok_or(NsvStatus::INVALID_PARAMETER)?;
            *locker.host_frames.get(page_in_locker as usize).ok_or(NsvStatus::INVALID_PARAMETER)?
        } else {
            0
        };

        let vcpus = self.vcpus.read();
        let any_vcpu = vcpus.iter().flatten().next().ok_or(NsvStatus::UNINITIALIZED)?;
        let rwx_flags =
            any_vcpu.nps_entry_flags(MappingAttributes::new(true, true, true, attrs.psize()));
        let leaf_flags = any_vcpu.nps_entry_flags(attrs);

        if attrs.requests_mapping() {
            let mut blocks = self.memory_blocks.write();
            if blocks.len() >= crate::config::MEMORY_BLOCK_LIMIT_PER_VM {
                return Err(NsvStatus::INSUFFICIENT_RESOURCES);
            }
            blocks.push(MemoryBlockEntry { mapping_id, gpa });
        }

        let mut mappings = self.mappings.write();
        let npt = mappings.get_mut(mapping_id as usize).ok_or(NsvStatus::INVALID_PARAMETER)?;
        npt.map_page(gpa, host_frame, attrs, rwx_flags, leaf_flags)?;
        drop(mappings);
        let bound = self.vcpu_mapping_id.read();
        for (index, vcpu) in vcpus.iter().enumerate().filter_map(|(i, v)| v.as_ref().map(|v| (i, v)))
        {
            if bound.get(index).copied() == Some(mapping_id) {
                vcpu.invalidate_nested_paging_caches();
            }
        }
        Ok(())
    }

    /// `RegisterMmioRegion`: claims `range` of guest-physical address space
    /// for `handler`, serviced by the caller of `run_vcpu` after it decodes
    /// a `MemoryAccess` exit and calls [`Self::dispatch_mmio`].
    pub fn register_mmio_region(&self, range: Range<u64>, handler: AccessHandler) -> bool {
        self.mmio.lock().register(range, handler)
    }

    /// Frees the MMIO region starting at `start`, if any.
    pub fn unregister_mmio_region(&self, start: u64) -> bool {
        self.mmio.lock().unregister(start)
    }

    /// Dispatches a decoded `size`-byte access at guest-physical `gpa` to
    /// whichever registered MMIO region claims it.
    pub fn dispatch_mmio(&self, gpa: u64, size: u8, write: bool, value: &mut u64) -> bool {
        self.mmio.lock().dispatch(gpa, size, write, value)
    }

    /// `RegisterPioRegion`: as [`Self::register_mmio_region`], for port I/O.
    pub fn register_pio_region(&self, range: Range<u64>, handler: AccessHandler) -> bool {
        self.pio.lock().register(range, handler)
    }

    /// Frees the PIO region starting at `start`, if any.
    pub fn unregister_pio_region(&self, start: u64) -> bool {
        self.pio.lock().unregister(start)
    }

    /// Dispatches a decoded port I/O access to whichever registered PIO
    /// region claims it.
    pub fn dispatch_pio(&self, port: u64, size: u8, write: bool, value: &mut u64) -> bool {
        self.pio.lock().dispatch(port, size, write, value)
    }

    /// Every live vCPU in this VM, in index order (skipping released slots).
    pub fn vcpus(&self) -> Vec<Arc<Vcpu>> {
        self.vcpus.read().iter().flatten().cloned().collect()
    }

    /// Records that `gpa`'s page was touched by the guest. The dispatcher
    /// calls this for every resolved `InterceptCode::MemoryAccess` exit, the
    /// same way the source's SVM back-end harvests the NPT accessed bit.
    pub fn mark_accessed(&self, gpa: u64) {
        self.accessed_pages.write().insert(gpa >> PAGE_SHIFT);
    }

    /// `QueryGpaAdMap`: a packed bitmap, one bit per page starting at
    /// `gpa_start`, set for every page in `[gpa_start, gpa_start +
    /// page_count * 4096)` recorded as accessed since the last clear.
    #[must_use]
    pub fn query_gpa_accessing_bitmap(&self, gpa_start: u64, page_count: u32) -> Vec<u8> {
        let start_page = gpa_start >> PAGE_SHIFT;
        let mut bitmap = alloc::vec![0u8; (page_count as usize + 7) / 8];
        let accessed = self.accessed_pages.read();
        for i in 0..u64::from(page_count) {
            if accessed.contains(&(start_page + i)) {
                bitmap[(i / 8) as usize] |= 1 << (i % 8);
            }
        }
        bitmap
    }

    /// `ClearGpaAdBits`: clears the accessed flag for every page in
    /// `[gpa_start, gpa_start + page_count * 4096)`.
    pub fn clear_gpa_accessing_bits(&self, gpa_start: u64, page_count: u32) {
        let start_page = gpa_start >> PAGE_SHIFT;
        let mut accessed = self.accessed_pages.write();
        for i in 0..u64::from(page_count) {
            accessed.remove(&(start_page + i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npt::{NestedEntryFlags, PageSize};
    use crate::regs::{GuestRegisters, RegisterClass};

    #[derive(Debug, Default)]
    struct FakeVt;

    impl HardwareVt for FakeVt {
        fn enable(&mut self) {}
        fn initialize(&mut self, _nested_pml4_addr: u64) {}
        fn load_gprs(&mut self, _registers: &GuestRegisters) {}
        fn view_gprs(&self) -> GuestRegisters {
            GuestRegisters::default()
        }
        fn load_register(&mut self, _class: RegisterClass, _value: u64) {}
        fn view_register(&self, _class: RegisterClass) -> u64 {
            0
        }
        fn run(&mut self) -> crate::hardware_vt::VendorExit {
            crate::hardware_vt::VendorExit::Hlt
        }
        fn inject_event(&mut self, _injection: crate::exit::EventInjection) {}
        fn interrupt_window_open(&self) -> bool {
            true
        }
        fn invalidate_nested_paging_caches(&mut self) {}
        fn nps_entry_flags(&self, _attrs: MappingAttributes) -> NestedEntryFlags {
            NestedEntryFlags { permission: 0b111, memory_type: 6 }
        }
    }

    #[test]
    fn create_vcpu_rejects_a_duplicate_index() {
        let vm = Vm::new(1, 16);
        vm.create_vcpu(0, Box::new(FakeVt)).unwrap();
        let err = vm.create_vcpu(0, Box::new(FakeVt)).unwrap_err();
        assert_eq!(err, NsvStatus::VCPU_ALREADY_CREATED);
    }

    #[test]
    fn release_then_recreate_succeeds() {
        let vm = Vm::new(1, 16);
        vm.create_vcpu(0, Box::new(FakeVt)).unwrap();
        vm.release_vcpu(0);
        assert!(vm.vcpu(0).is_none());
        vm.create_vcpu(0, Box::new(FakeVt)).unwrap();
        assert!(vm.vcpu(0).is_some());
    }

    #[test]
    fn set_mapping_requires_at_least_one_vcpu() {
        let vm = Vm::new(1, 16);
        let attrs = MappingAttributes::new(true, true, false, PageSize::Size4K);
        let err = vm.set_mapping(0, 0x1000, 0, 0, attrs).unwrap_err();
        assert_eq!(err, NsvStatus::UNINITIALIZED);
    }

    #[test]
    fn set_mapping_round_trips_once_a_vcpu_exists() {
        let vm = Vm::new(1, 16);
        vm.create_vcpu(0, Box::new(FakeVt)).unwrap();
        let locker = vm.lock_memory(0x7000, alloc::vec![7]).unwrap();
        let attrs = MappingAttributes::new(true, true, false, PageSize::Size4K);
        vm.set_mapping(0, 0x2000, locker, 0, attrs).unwrap();
    }

    #[test]
    fn set_mapping_rejects_an_unknown_mapping_set() {
        let vm = Vm::new(1, 16);
        vm.create_vcpu(0, Box::new(FakeVt)).unwrap();
        let locker = vm.lock_memory(0x7000, alloc::vec![7]).unwrap();
        let attrs = MappingAttributes::new(true, true, false, PageSize::Size4K);
        let err = vm.set_mapping(5, 0x2000, locker, 0, attrs).unwrap_err();
        assert_eq!(err, NsvStatus::INVALID_PARAMETER);
    }

    #[test]
    fn set_mapping_rejects_an_unknown_locker() {
        let vm = Vm::new(1, 16);
        vm.create_vcpu(0, Box::new(FakeVt)).unwrap();
        let attrs = MappingAttributes::new(true, true, false, PageSize::Size4K);
        let err = vm.set_mapping(0, 0x2000, 9, 0, attrs).unwrap_err();
        assert_eq!(err, NsvStatus::INVALID_PARAMETER);
    }

    #[test]
    fn unmap_requires_no_locker() {
        let vm = Vm::new(1, 16);
        vm.create_vcpu(0, Box::new(FakeVt)).unwrap();
        vm.set_mapping(0, 0x2000, 0xdead, 0, MappingAttributes::unmap(PageSize::Size4K)).unwrap();
    }

    #[test]
    fn lock_memory_is_bounded_and_reusable_after_unlock() {
        let vm = Vm::new(1, 16);
        for _ in 0..crate::config::LOCKER_LIST_LIMIT_PER_VM {
            vm.lock_memory(0x1000, alloc::vec![1]).unwrap();
        }
        let err = vm.lock_memory(0x1000, alloc::vec![1]).unwrap_err();
        assert_eq!(err, NsvStatus::INSUFFICIENT_RESOURCES);
        vm.unlock_memory(0).unwrap();
        vm.lock_memory(0x1000, alloc::vec![1]).unwrap();
    }

    #[test]
    fn unlock_memory_rejects_an_unknown_id() {
        let vm = Vm::new(1, 16);
        let err = vm.unlock_memory(0).unwrap_err();
        assert_eq!(err, NsvStatus::INVALID_PARAMETER);
    }

    #[test]
    fn mmio_dispatch_reaches_the_registered_handler() {
        let vm = Vm::new(1, 16);
        assert!(vm.register_mmio_region(0x1000..0x2000, Box::new(|_, _, _, value| {
            *value = 0x42;
            true
        })));
        let mut value = 0;
        assert!(vm.dispatch_mmio(0x1000, 4, false, &mut value));
        assert_eq!(value, 0x42);
        assert!(vm.unregister_mmio_region(0x1000));
        assert!(!vm.dispatch_mmio(0x1000, 4, false, &mut value));
    }

    #[test]
    fn pio_dispatch_is_independent_of_mmio() {
        let vm = Vm::new(1, 16);
        assert!(vm.register_pio_region(0x60..0x61, Box::new(|_, _, _, value| {
            *value = 0x7;
            true
        })));
        let mut value = 0;
        assert!(vm.dispatch_pio(0x60, 1, false, &mut value));
        assert_eq!(value, 0x7);
        assert!(!vm.dispatch_mmio(0x60, 1, false, &mut value));
    }

    #[test]
    fn a_vm_with_no_vcpus_is_not_busy() {
        let vm = Vm::new(1, 16);
        assert!(!vm.is_busy());
    }

    #[test]
    fn an_in_flight_run_marks_the_vm_busy() {
        let vm = Vm::new(1, 16);
        vm.begin_run();
        assert!(vm.is_busy());
        vm.end_run();
        assert!(!vm.is_busy());
    }

    #[test]
    fn a_live_vcpu_marks_the_vm_busy_even_without_a_run_in_flight() {
        let vm = Vm::new(1, 16);
        vm.create_vcpu(0, Box::new(FakeVt)).unwrap();
        assert!(vm.is_busy());
        vm.release_vcpu(0);
        assert!(!vm.is_busy());
    }

    #[test]
    fn vcpu_starts_bound_to_mapping_set_zero_and_can_be_rebound() {
        let vm = Vm::new(1, 16);
        vm.create_vcpu(0, Box::new(FakeVt)).unwrap();
        assert_eq!(vm.vcpu_mapping_id(0), Some(0));
        let extra = vm.add_mapping_set(16);
        vm.set_vcpu_mapping_id(0, extra).unwrap();
        assert_eq!(vm.vcpu_mapping_id(0), Some(extra));
    }

    #[test]
    fn rebinding_an_unknown_vcpu_reports_not_exist() {
        let vm = Vm::new(1, 16);
        let err = vm.set_vcpu_mapping_id(0, 0).unwrap_err();
        assert_eq!(err, NsvStatus::VCPU_NOT_EXIST);
    }

    #[test]
    fn accessed_bitmap_reports_only_touched_pages() {
        let vm = Vm::new(1, 16);
        vm.mark_accessed(0x3000);
        vm.mark_accessed(0x5000);
        let bitmap = vm.query_gpa_accessing_bitmap(0x1000, 8);
        // Pages 2 (0x3000) and 4 (0x5000) relative to 0x1000.
        assert_eq!(bitmap, alloc::vec![0b0001_0100]);
    }

    #[test]
    fn clearing_accessed_bits_removes_them_from_the_next_query() {
        let vm = Vm::new(1, 16);
        vm.mark_accessed(0x3000);
        vm.clear_gpa_accessing_bits(0x3000, 1);
        let bitmap = vm.query_gpa_accessing_bitmap(0x3000, 1);
        assert_eq!(bitmap, alloc::vec![0]);
    }
}
