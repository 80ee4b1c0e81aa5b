//! Vendor-agnostic hardware-assisted virtualization (SVM / VMX) interface.
//!
//! Generalizes the single-guest `run`/`revert_registers` contract into the
//! broader set of operations a customizable VM needs: per-class register
//! load/dump against the lazily-synchronized state cache, event injection,
//! and an exit taxonomy wide enough to cover every `InterceptCode`.

pub mod svm;
pub mod vmx;

use crate::exit::{EventInjection, ExceptionContext, IoContext, MsrContext};
use crate::npt::{MappingAttributes, NestedEntryFlags};
use crate::regs::{GuestRegisters, RegisterClass};
use alloc::boxed::Box;
use core::fmt;

/// Picks the `HardwareVt` implementation matching the current processor's
/// vendor string, the way `rhv`'s boot path branches on
/// `x86::cpuid::CpuId::get_vendor_info` before constructing its single
/// hard-coded backend.
///
/// # Errors
/// [`crate::status::NsvStatus::HYPERVISION_ABSENT`] on a vendor neither
/// backend supports.
pub fn detect_and_create() -> crate::status::NsvResult<Box<dyn HardwareVt + Send>> {
    let vendor = x86::cpuid::CpuId::new().get_vendor_info();
    match vendor.as_ref().map(|v| v.as_str()) {
        Some("AuthenticAMD") => Ok(Box::new(svm::Svm::new())),
        Some("GenuineIntel") => Ok(Box::new(vmx::Vmx::new())),
        _ => Err(crate::status::NsvStatus::HYPERVISION_ABSENT),
    }
}

/// An interface to enable HW VT, configure a single vCPU, and run it until
/// the next `VMEXIT`.
///
/// One implementation per vendor (`svm`, `vmx`); `vcpu::Vcpu` owns a
/// `Box<dyn HardwareVt>` chosen at `create_vcpu` time based on
/// `x86::cpuid` feature bits.
pub trait HardwareVt: fmt::Debug {
    /// Enables HW VT on the current processor. Must be called exactly once
    /// before any other method.
    fn enable(&mut self);

    /// Configures the vCPU's nested-paging root and baseline intercepts.
    fn initialize(&mut self, nested_pml4_addr: u64);

    /// Loads the general-purpose registers, RIP, and RFLAGS described by
    /// `registers` into hardware. Called by `edit_registers` on
    /// [`crate::regs::RegisterClass::GeneralPurpose`] and once at vCPU
    /// creation.
    fn load_gprs(&mut self, registers: &GuestRegisters);

    /// Reads back the current general-purpose registers, RIP, and RFLAGS.
    fn view_gprs(&self) -> GuestRegisters;

    /// Loads a non-GPR register class from `value` into hardware; `value`'s
    /// shape must match what [`HardwareVt::view_register`] would report for
    /// the same class.
    fn load_register(&mut self, class: RegisterClass, value: u64);

    /// Reads back a non-GPR register class's current hardware value. Only
    /// called when the owning `StateCache` says a read-back is due.
    fn view_register(&self, class: RegisterClass) -> u64;

    /// Runs the guest until the next `VMEXIT` and reports the reason.
    fn run(&mut self) -> VendorExit;

    /// Queues `injection` for delivery at the next guest entry that has an
    /// open interrupt (or NMI) window.
    fn inject_event(&mut self, injection: EventInjection);

    /// True when the processor is currently in an interrupt shadow (one
    /// instruction past `STI`/`MOV SS`) or has NMIs blocked.
    fn interrupt_window_open(&self) -> bool;

    /// Invalidates cached nested-paging translations after `NptManager`
    /// mutates the tree the vCPU is running under.
    fn invalidate_nested_paging_caches(&mut self);

    /// Maps [`MappingAttributes`] to the vendor-specific permission and
    /// memory-type bits [`crate::npt::NptManager`] stores in each leaf.
    fn nps_entry_flags(&self, attrs: MappingAttributes) -> NestedEntryFlags;
}

/// Vendor-reported reason the guest exited, prior to being folded into an
/// [`crate::exit::ExitContext`] by the dispatcher.
#[derive(Debug)]
pub enum VendorExit {
    /// Nested-paging translation fault.
    NestedPageFault(NestedPageFaultQualification),
    /// An intercepted exception.
    Exception(ExceptionContext),
    /// Port I/O.
    Io(IoContext),
    /// `RDMSR`/`WRMSR`; `write` distinguishes the two.
    Msr(MsrContext, bool),
    /// `CPUID`, carrying the leaf/subleaf requested (EAX/ECX on entry).
    Cpuid(u32, u32),
    /// Control-register access; `cr_number`, `gpr_number`, `write`.
    CrAccess(u8, u8, bool),
    /// Debug-register access; `dr_number`, `gpr_number`, `write`.
    DrAccess(u8, u8, bool),
    /// `HLT` executed.
    Hlt,
    /// A hypercall; the hypercall number taken from RAX.
    Hypercall(u64),
    /// An external interrupt arrived, or `PAUSE` fired its loop-exit
    /// threshold.
    ExternalInterruptOrPause,
    /// A previously-pending injection was delivered and the window is open
    /// again for the next one.
    InterruptWindowOpen,
    /// A hardware task switch.
    TaskSwitch,
    /// The vCPU's state failed a precondition check on entry.
    InvalidGuestState,
    /// Triple fault or other unrecoverable shutdown.
    Shutdown(u64),
    /// An unhandled, vendor-specific exit code; the dispatcher reports this
    /// as [`crate::exit::InterceptCode::ShutdownCondition`] rather than
    /// guessing at its meaning.
    Unexpected(u64),
}

/// Details of a nested-paging translation fault.
#[derive(Debug)]
pub struct NestedPageFaultQualification {
    /// RIP at the time of the fault.
    pub rip: u64,
    /// The guest-physical address that failed translation.
    pub gpa: u64,
    /// True when no translation exists at all, as opposed to an existing
    /// translation lacking the requested permission.
    pub missing_translation: bool,
    /// True when the faulting access was a write.
    pub write_access: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_exit_variants_carry_their_qualification() {
        let exit = VendorExit::CrAccess(3, 0, true);
        match exit {
            VendorExit::CrAccess(cr, gpr, write) => {
                assert_eq!(cr, 3);
                assert_eq!(gpr, 0);
                assert!(write);
            }
            _ => unreachable!(),
        }
    }
}
