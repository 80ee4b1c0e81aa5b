//! The module containing [`Cvm`], the subsystem's single entry point.
//!
//! Wires together [`HandleTable`], [`ReverseMappingTable`], [`Vm`], and
//! [`Vcpu`] into the IOCTL-table surface a platform driver forwards
//! untrusted user-mode requests through (`CreateVm`, `ReleaseVm`,
//! `CreateVm2`, `SetMapping`/`SetMapping2`, `QueryGpaAdMap`,
//! `ClearGpaAdBits`, `QueryHvStatus`, `CreateVcpu`, `ReleaseVcpu`,
//! `RunVcpu`, `ViewVcpuReg`, `EditVcpuReg`, `RescindVcpu`, `InjectEvent`,
//! `SetVcpuOptions`, `QueryVcpuStats`, `GetVcpuVmMap`, `SetVcpuVmMap`).
//! Every handle this module mints is an opaque `u64`; the platform driver
//! never sees a `Vm`/`Vcpu` reference directly.

use crate::config::NESTED_PAGING_STRUCTURE_POOL_SIZE;
use crate::exit::{EventInjection, ExitContext};
use crate::handle_table::HandleTable;
use crate::hardware_vt;
use crate::npt::MappingAttributes;
use crate::regs::{GuestRegisters, RegisterClass};
use crate::status::{NsvResult, NsvStatus};
use crate::synthetic::{CvmCapabilities, HvStatusQuery, HypercallInstruction};
use crate::vcpu::{CpuidQuickpath, VcpuOptions};
use crate::vm::Vm;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

/// Runtime statistics `QueryVcpuStats` reports for one vCPU.
#[derive(Clone, Copy, Debug, Default)]
pub struct VcpuStats {
    /// Total number of `VMEXIT`s serviced (internal and external).
    pub exit_count: u64,
    /// Number of those exits returned to the caller (excludes internal
    /// scheduler loops).
    pub reported_exit_count: u64,
}

/// The subsystem's single entry point: owns the VM handle table and hands
/// out stable ASIDs.
pub struct Cvm {
    vms: HandleTable<Vm>,
    next_asid: AtomicU32,
}

impl Default for Cvm {
    fn default() -> Self {
        Self::new()
    }
}

impl Cvm {
    /// Creates an empty subsystem. ASID `0` is reserved (mirrors the source's
    /// ASID-0-means-host convention), so the first VM gets ASID `1`.
    #[must_use]
    pub fn new() -> Self {
        Self { vms: HandleTable::new(), next_asid: AtomicU32::new(1) }
    }

    /// `CreateVm`: creates a VM with a single default-sized mapping set and
    /// returns its handle.
    ///
    /// # Errors
    /// See [`HandleTable::create_handle`].
    pub fn create_vm(&self) -> NsvResult<u64> {
        self.create_vm2(NESTED_PAGING_STRUCTURE_POOL_SIZE)
    }

    /// `CreateVm2`: as [`Cvm::create_vm`], but with an explicit nested-paging
    /// pool size (the "properties" `CreateVm2` adds over `CreateVm`).
    ///
    /// # Errors
    /// See [`HandleTable::create_handle`].
    pub fn create_vm2(&self, nps_pool_size: usize) -> NsvResult<u64> {
        let asid = self.next_asid.fetch_add(1, Ordering::Relaxed);
        let vm = Arc::new(Vm::new(asid, nps_pool_size));
        self.vms.create_handle(vm)
    }

    /// `ReleaseVm`: frees `vm_handle`, and with it every vCPU it owns (the
    /// last `Arc<Vm>`/`Arc<Vcpu>` strong reference is dropped once in-flight
    /// `run_vcpu` calls return).
    ///
    /// # Errors
    /// [`NsvStatus::VM_BUSY`] if the VM still owns a vCPU, or a `run_vcpu`
    /// against one of its vCPUs is in flight; [`NsvStatus::INVALID_PARAMETER`]
    /// if `vm_handle` is unknown.
    pub fn release_vm(&self, vm_handle: u64) -> NsvResult<()> {
        let vm = self.vm(vm_handle)?;
        if vm.is_busy() {
            return Err(NsvStatus::VM_BUSY);
        }
        self.vms.delete_handle(vm_handle);
        Ok(())
    }

    fn vm(&self, vm_handle: u64) -> NsvResult<Arc<Vm>> {
        self.vms.reference(vm_handle).ok_or(NsvStatus::INVALID_PARAMETER)
    }

    /// `SetMapping`: installs or removes a translation in VM `vm_handle`'s
    /// default (mapping set `0`) address space, resolving the host frame
    /// from locker `locker_id` at `page_in_locker`.
    ///
    /// # Errors
    /// See [`Vm::set_mapping`], plus [`NsvStatus::INVALID_PARAMETER`] if
    /// `vm_handle` is unknown.
    pub fn set_mapping(
        &self,
        vm_handle: u64,
        gpa: u64,
        locker_id: u32,
        page_in_locker: u32,
        attrs: MappingAttributes,
    ) -> NsvResult<()> {
        self.vm(vm_handle)?.set_mapping(0, gpa, locker_id, page_in_locker, attrs)
    }

    /// `SetMapping2`: as [`Cvm::set_mapping`], targeting an explicit mapping
    /// set id.
    ///
    /// # Errors
    /// See [`Vm::set_mapping`], plus [`NsvStatus::INVALID_PARAMETER`] if
    /// `vm_handle` is unknown.
    pub fn set_mapping2(
        &self,
        vm_handle: u64,
        mapping_id: u32,
        gpa: u64,
        locker_id: u32,
        page_in_locker: u32,
        attrs: MappingAttributes,
    ) -> NsvResult<()> {
        self.vm(vm_handle)?.set_mapping(mapping_id, gpa, locker_id, page_in_locker, attrs)
    }

    /// `LockMemory`: pins `host_frames` for VM `vm_handle`, returning the
    /// locker id `SetMapping`/`SetMapping2` reference by index.
    ///
    /// # Errors
    /// See [`Vm::lock_memory`], plus [`NsvStatus::INVALID_PARAMETER`] if
    /// `vm_handle` is unknown.
    pub fn lock_memory(&self, vm_handle: u64, hva: u64, host_frames: Vec<u64>) -> NsvResult<u32> {
        self.vm(vm_handle)?.lock_memory(hva, host_frames)
    }

    /// `UnlockMemory`: releases locker `id` for VM `vm_handle`.
    ///
    /// # Errors
    /// See [`Vm::unlock_memory`], plus [`NsvStatus::INVALID_PARAMETER`] if
    /// `vm_handle` is unknown.
    pub fn unlock_memory(&self, vm_handle: u64, id: u32) -> NsvResult<()> {
        self.vm(vm_handle)?.unlock_memory(id)
    }

    /// `RegisterMmioRegion`: claims `range` of `vm_handle`'s guest-physical
    /// address space for `handler`.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `vm_handle` is unknown, or
    /// `range` overlaps an already-registered region.
    pub fn register_mmio_region(
        &self,
        vm_handle: u64,
        range: core::ops::Range<u64>,
        handler: crate::mmio::AccessHandler,
    ) -> NsvResult<()> {
        self.vm(vm_handle)?.register_mmio_region(range, handler).then_some(()).ok_or(NsvStatus::INVALID_PARAMETER)
    }

    /// Dispatches a decoded MMIO access for `vm_handle`'s `run_vcpu` caller.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `vm_handle` is unknown, or no
    /// registered region claims `gpa`.
    pub fn dispatch_mmio(&self, vm_handle: u64, gpa: u64, size: u8, write: bool, value: &mut u64) -> NsvResult<()> {
        self.vm(vm_handle)?
            .dispatch_mmio(gpa, size, write, value)
            .then_some(())
            .ok_or(NsvStatus::INVALID_PARAMETER)
    }

    /// `RegisterPioRegion`: as [`Cvm::register_mmio_region`], for port I/O.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `vm_handle` is unknown, or
    /// `range` overlaps an already-registered region.
    pub fn register_pio_region(
        &self,
        vm_handle: u64,
        range: core::ops::Range<u64>,
        handler: crate::mmio::AccessHandler,
    ) -> NsvResult<()> {
        self.vm(vm_handle)?.register_pio_region(range, handler).then_some(()).ok_or(NsvStatus::INVALID_PARAMETER)
    }

    /// Dispatches a decoded port I/O access for `vm_handle`'s `run_vcpu`
    /// caller.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `vm_handle` is unknown, or no
    /// registered region claims `port`.
    pub fn dispatch_pio(&self, vm_handle: u64, port: u64, size: u8, write: bool, value: &mut u64) -> NsvResult<()> {
        self.vm(vm_handle)?.dispatch_pio(port, size, write, value).then_some(()).ok_or(NsvStatus::INVALID_PARAMETER)
    }

    /// `QueryGpaAdMap`: the accessed-page bitmap for `vm_handle` over
    /// `[gpa_start, gpa_start + page_count * 4096)`.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `vm_handle` is unknown.
    pub fn query_gpa_ad_map(&self, vm_handle: u64, gpa_start: u64, page_count: u32) -> NsvResult<Vec<u8>> {
        Ok(self.vm(vm_handle)?.query_gpa_accessing_bitmap(gpa_start, page_count))
    }

    /// `ClearGpaAdBits`: clears the accessed flag for `vm_handle` over
    /// `[gpa_start, gpa_start + page_count * 4096)`.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `vm_handle` is unknown.
    pub fn clear_gpa_ad_bits(&self, vm_handle: u64, gpa_start: u64, page_count: u32) -> NsvResult<()> {
        self.vm(vm_handle)?.clear_gpa_accessing_bits(gpa_start, page_count);
        Ok(())
    }

    /// `QueryHvStatus`: the synthetic-hypervisor presence surface (§6.2),
    /// independent of any particular VM.
    #[must_use]
    pub fn query_hv_status(&self, query: HvStatusQuery) -> HvStatusResult {
        match query {
            HvStatusQuery::Presence => HvStatusResult::Presence(true),
            HvStatusQuery::Capabilities => {
                let mut caps = CvmCapabilities::empty();
                caps.set_cpuid_quickpath(1);
                caps.set_nested_virtualization(0);
                caps.set_monitor_trap(1);
                HvStatusResult::Capabilities(caps)
            }
            HvStatusQuery::HypercallInstruction => {
                let instruction = if is_amd() {
                    crate::synthetic::HYPERCALL_INSTRUCTION_SVM
                } else {
                    crate::synthetic::HYPERCALL_INSTRUCTION_VMX
                };
                HvStatusResult::HypercallInstruction(instruction)
            }
        }
    }

    /// `CreateVcpu`: creates vCPU `vp_index` under `vm_handle`, selecting the
    /// `HardwareVt` backend for the current processor's vendor.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `vm_handle` is unknown;
    /// [`NsvStatus::HYPERVISION_ABSENT`] if the processor vendor has no
    /// supported backend; [`NsvStatus::VCPU_ALREADY_CREATED`] if `vp_index`
    /// is already in use.
    pub fn create_vcpu(&self, vm_handle: u64, vp_index: u32) -> NsvResult<()> {
        let vm = self.vm(vm_handle)?;
        let vt = hardware_vt::detect_and_create()?;
        vm.create_vcpu(vp_index, vt)?;
        Ok(())
    }

    /// `ReleaseVcpu`: releases vCPU `vp_index` under `vm_handle`.
    ///
    /// # Errors
    /// [`NsvStatus::INVALID_PARAMETER`] if `vm_handle` is unknown.
    pub fn release_vcpu(&self, vm_handle: u64, vp_index: u32) -> NsvResult<()> {
        self.vm(vm_handle)?.release_vcpu(vp_index);
        Ok(())
    }

    fn vcpu(&self, vm_handle: u64, vp_index: u32) -> NsvResult<Arc<crate::vcpu::Vcpu>> {
        self.vm(vm_handle)?.vcpu(vp_index).ok_or(NsvStatus::VCPU_NOT_EXIST)
    }

    /// `RunVcpu`: runs vCPU `vp_index` until the next caller-visible exit or
    /// a pending rescission. Records the exit's faulting GPA against
    /// `vm_handle`'s accessed-page bitmap when applicable.
    ///
    /// # Errors
    /// See [`Vcpu::run`](crate::vcpu::Vcpu::run), plus
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn run_vcpu(&self, vm_handle: u64, vp_index: u32) -> NsvResult<ExitContext> {
        let vm = self.vm(vm_handle)?;
        let vcpu = vm.vcpu(vp_index).ok_or(NsvStatus::VCPU_NOT_EXIST)?;
        vm.begin_run();
        let result = vcpu.run();
        vm.end_run();
        let context = result?;
        if let Some(memory) = context.memory {
            vm.mark_accessed(memory.gpa);
        }
        Ok(context)
    }

    /// `ViewVcpuReg`: reads back register class `class` for vCPU `vp_index`.
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn view_vcpu_reg(&self, vm_handle: u64, vp_index: u32, class: RegisterClass) -> NsvResult<u64> {
        Ok(self.vcpu(vm_handle, vp_index)?.view_register(class))
    }

    /// `ViewVcpuReg` for [`RegisterClass::GeneralPurpose`]: the full GPR
    /// file rather than a single `u64`.
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn view_vcpu_gprs(&self, vm_handle: u64, vp_index: u32) -> NsvResult<GuestRegisters> {
        Ok(self.vcpu(vm_handle, vp_index)?.view_gprs())
    }

    /// `EditVcpuReg`: writes register class `class` for vCPU `vp_index`.
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn edit_vcpu_reg(&self, vm_handle: u64, vp_index: u32, class: RegisterClass, value: u64) -> NsvResult<()> {
        self.vcpu(vm_handle, vp_index)?.edit_register(class, value);
        Ok(())
    }

    /// `EditVcpuReg` for [`RegisterClass::GeneralPurpose`].
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn edit_vcpu_gprs(&self, vm_handle: u64, vp_index: u32, registers: &GuestRegisters) -> NsvResult<()> {
        self.vcpu(vm_handle, vp_index)?.edit_gprs(registers);
        Ok(())
    }

    /// `RescindVcpu`: forces vCPU `vp_index` out of `run_vcpu`.
    ///
    /// # Errors
    /// [`NsvStatus::ALREADY_RESCINDED`] if a rescission is already pending;
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn rescind_vcpu(&self, vm_handle: u64, vp_index: u32) -> NsvResult<()> {
        self.vcpu(vm_handle, vp_index)?.rescind()
    }

    /// `InjectEvent`: queues `injection` for vCPU `vp_index`.
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn inject_event(&self, vm_handle: u64, vp_index: u32, injection: EventInjection) -> NsvResult<()> {
        self.vcpu(vm_handle, vp_index)?.inject_event(injection);
        Ok(())
    }

    /// `SetVcpuOptions`: sets option flags for vCPU `vp_index`.
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn set_vcpu_options(&self, vm_handle: u64, vp_index: u32, options: VcpuOptions) -> NsvResult<()> {
        self.vcpu(vm_handle, vp_index)?.set_options(options);
        Ok(())
    }

    /// `SetVcpuOptions`' quickpath-table half: installs vCPU `vp_index`'s
    /// `CPUID` quickpath overrides.
    ///
    /// # Errors
    /// See [`Vcpu::set_cpuid_quickpath`](crate::vcpu::Vcpu::set_cpuid_quickpath),
    /// plus [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn set_cpuid_quickpath(
        &self,
        vm_handle: u64,
        vp_index: u32,
        table: Vec<CpuidQuickpath>,
    ) -> NsvResult<()> {
        self.vcpu(vm_handle, vp_index)?.set_cpuid_quickpath(table)
    }

    /// `QueryVcpuStats`: returns a zeroed [`VcpuStats`] for now; the
    /// dispatcher does not yet maintain per-vCPU exit counters.
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn query_vcpu_stats(&self, vm_handle: u64, vp_index: u32) -> NsvResult<VcpuStats> {
        self.vcpu(vm_handle, vp_index)?;
        Ok(VcpuStats::default())
    }

    /// `GetVcpuVmMap`: the mapping-set id vCPU `vp_index` is bound to.
    ///
    /// # Errors
    /// [`NsvStatus::VCPU_NOT_EXIST`]/[`NsvStatus::INVALID_PARAMETER`].
    pub fn get_vcpu_vm_map(&self, vm_handle: u64, vp_index: u32) -> NsvResult<u32> {
        self.vm(vm_handle)?.vcpu_mapping_id(vp_index).ok_or(NsvStatus::VCPU_NOT_EXIST)
    }

    /// `SetVcpuVmMap`: rebinds vCPU `vp_index` to mapping set `mapping_id`.
    ///
    /// # Errors
    /// See [`Vm::set_vcpu_mapping_id`], plus [`NsvStatus::INVALID_PARAMETER`]
    /// if `vm_handle` is unknown.
    pub fn set_vcpu_vm_map(&self, vm_handle: u64, vp_index: u32, mapping_id: u32) -> NsvResult<()> {
        self.vm(vm_handle)?.set_vcpu_mapping_id(vp_index, mapping_id)
    }
}

/// `QueryHvStatus`'s result, tagged by which [`HvStatusQuery`] was asked.
#[derive(Clone, Copy, Debug)]
pub enum HvStatusResult {
    /// Answer to [`HvStatusQuery::Presence`].
    Presence(bool),
    /// Answer to [`HvStatusQuery::Capabilities`].
    Capabilities(CvmCapabilities),
    /// Answer to [`HvStatusQuery::HypercallInstruction`].
    HypercallInstruction(HypercallInstruction),
}

fn is_amd() -> bool {
    x86::cpuid::CpuId::new().get_vendor_info().map(|v| v.as_str() == "AuthenticAMD").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npt::PageSize;

    #[test]
    fn create_vm_then_release_invalidates_the_handle() {
        let cvm = Cvm::new();
        let handle = cvm.create_vm().unwrap();
        cvm.release_vm(handle).unwrap();
        let err = cvm.query_gpa_ad_map(handle, 0, 1).unwrap_err();
        assert_eq!(err, NsvStatus::INVALID_PARAMETER);
    }

    #[test]
    fn release_vm_against_an_unknown_handle_is_rejected() {
        let cvm = Cvm::new();
        let err = cvm.release_vm(0xdead_beef).unwrap_err();
        assert_eq!(err, NsvStatus::INVALID_PARAMETER);
    }

    #[test]
    fn operations_against_an_unknown_vm_are_rejected() {
        let cvm = Cvm::new();
        let err = cvm.run_vcpu(0xdead_beef, 0).unwrap_err();
        assert_eq!(err, NsvStatus::INVALID_PARAMETER);
    }

    #[test]
    fn operations_against_an_uncreated_vcpu_are_rejected() {
        let cvm = Cvm::new();
        let handle = cvm.create_vm().unwrap();
        let err = cvm.rescind_vcpu(handle, 0).unwrap_err();
        assert_eq!(err, NsvStatus::VCPU_NOT_EXIST);
    }

    #[test]
    fn each_vm_gets_a_distinct_ascending_asid() {
        let cvm = Cvm::new();
        let a = cvm.create_vm().unwrap();
        let b = cvm.create_vm().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn set_mapping_against_an_unknown_vm_is_rejected() {
        let cvm = Cvm::new();
        let attrs = MappingAttributes::new(true, true, false, PageSize::Size4K);
        let err = cvm.set_mapping(0xdead_beef, 0x1000, 0, 0, attrs).unwrap_err();
        assert_eq!(err, NsvStatus::INVALID_PARAMETER);
    }

    #[test]
    fn lock_memory_against_an_unknown_vm_is_rejected() {
        let cvm = Cvm::new();
        let err = cvm.lock_memory(0xdead_beef, 0x1000, alloc::vec![1]).unwrap_err();
        assert_eq!(err, NsvStatus::INVALID_PARAMETER);
    }

    #[test]
    fn mmio_dispatch_against_an_unknown_vm_is_rejected() {
        let cvm = Cvm::new();
        let mut value = 0;
        let err = cvm.dispatch_mmio(0xdead_beef, 0x1000, 4, false, &mut value).unwrap_err();
        assert_eq!(err, NsvStatus::INVALID_PARAMETER);
    }

    #[test]
    fn mmio_round_trips_through_the_cvm_entry_point() {
        let cvm = Cvm::new();
        let handle = cvm.create_vm().unwrap();
        cvm.register_mmio_region(
            handle,
            0x1000..0x2000,
            alloc::boxed::Box::new(|_, _, _, value| {
                *value = 0x99;
                true
            }),
        )
        .unwrap();
        let mut value = 0;
        cvm.dispatch_mmio(handle, 0x1000, 4, false, &mut value).unwrap();
        assert_eq!(value, 0x99);
    }

    #[test]
    fn presence_query_is_always_true() {
        let cvm = Cvm::new();
        assert!(matches!(cvm.query_hv_status(HvStatusQuery::Presence), HvStatusResult::Presence(true)));
    }
}
