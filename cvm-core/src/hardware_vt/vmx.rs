//! The module containing the [`Vmx`] type, which implements the
//! [`super::HardwareVt`] trait for Intel processors.
//!
//! The virtual-machine extensions (VMX) implement Intel Virtualization
//! Technology (VT-x), the hardware assisted virtualization technology on
//! Intel processors.
//!
//! All references to external resources (denoted with "See:") refer to
//! "Intel 64 and IA-32 Architectures Software Developer's Manual Volume 3"
//! Revision 78 (December 2022) at <https://www.intel.com/sdm/> unless
//! otherwise stated.

use super::{HardwareVt, NestedPageFaultQualification, VendorExit};
use crate::exit::{EventKind, EventInjection, ExceptionContext, IoContext, MsrContext};
use crate::npt::{MappingAttributes, NestedEntryFlags};
use crate::regs::{GuestRegisters, RegisterClass};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::arch::asm;
use core::fmt;
use log::warn;
use x86::{
    controlregs::{cr0, cr0_write, cr4, cr4_write, Cr0, Cr4},
    dtables::{sgdt, DescriptorTablePointer},
    irq, msr,
    segmentation::{
        cs, BuildDescriptor, Descriptor, DescriptorBuilder, GateDescriptorBuilder,
        SegmentSelector,
    },
    vmx::vmcs,
};

const IA32_VMX_PINBASED_CTLS_ACTIVATE_VMX_PREEMPTION_TIMER_FLAG: u64 = 1 << 6;

/// VMX-specific data to represent one vCPU.
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
pub struct Vmx {
    #[derivative(Debug = "ignore")]
    vmxon_region: Box<Vmxon>,
    #[derivative(Debug = "ignore")]
    vmcs_region: Box<Vmcs>,
    #[derivative(Debug = "ignore")]
    host_gdt: HostGdt,
    registers: GuestRegisters,
    launched: bool,
    timer_scale: Option<u64>,
    /// `XCR0`. The basic VMCS guest-state area has no field for it; the host
    /// has to save/restore it around `VMLAUNCH`/`VMRESUME` itself.
    xcr0: u64,
}

impl Vmx {
    /// Creates an (uninitialized) VMX vCPU backend.
    #[must_use]
    pub fn new() -> Self {
        let vmxon_region = unsafe { Box::<Vmxon>::new_zeroed().assume_init() };
        let vmcs_region = unsafe { Box::<Vmcs>::new_zeroed().assume_init() };
        Self {
            vmxon_region,
            vmcs_region,
            host_gdt: HostGdt::default(),
            registers: GuestRegisters::default(),
            launched: false,
            timer_scale: vmx_preemption_timer_scale(),
        }
    }
}

fn vmx_preemption_timer_scale() -> Option<u64> {
    if (adjust_vmx_control(
        VmxControl::PinBased,
        IA32_VMX_PINBASED_CTLS_ACTIVATE_VMX_PREEMPTION_TIMER_FLAG,
    ) & IA32_VMX_PINBASED_CTLS_ACTIVATE_VMX_PREEMPTION_TIMER_FLAG)
        == 0
    {
        warn!("VMX-preemption timer not available; relying on intercepts alone to regain control");
        None
    } else {
        const MASK: u64 = 0b1_1111;
        let bit_position = rdmsr(msr::IA32_VMX_MISC) & MASK;
        Some(1 << bit_position)
    }
}

impl HardwareVt for Vmx {
    /// Enables VMX operation and enters VMX root operation via VMXON.
    fn enable(&mut self) {
        cr4_write(cr4() | Cr4::CR4_ENABLE_VMX);
        adjust_feature_control_msr();
        adjust_cr0();
        let revision_id = rdmsr(msr::IA32_VMX_BASIC) as u32;
        self.vmxon_region.revision_id = revision_id;
        vmxon(&mut self.vmxon_region);
    }

    /// Intercepts CR/DR access, the exception set the guest can be
    /// configured to trap, port I/O, RDMSR/WRMSR, CPUID (unconditionally,
    /// matching SVM's always-on `CPUID` intercept), HLT, and task switch.
    /// Enables EPT and the VMX-preemption timer.
    fn initialize(&mut self, nested_pml4_addr: u64) {
        const PROCBASED_ACTIVATE_SECONDARY_CONTROLS: u64 = 1 << 31;
        const PROCBASED_HLT_EXITING: u64 = 1 << 7;
        const PROCBASED_CR3_LOAD_EXITING: u64 = 1 << 15;
        const PROCBASED_CR3_STORE_EXITING: u64 = 1 << 16;
        const PROCBASED_CR8_LOAD_EXITING: u64 = 1 << 19;
        const PROCBASED_CR8_STORE_EXITING: u64 = 1 << 20;
        const PROCBASED_MOV_DR_EXITING: u64 = 1 << 23;
        const PROCBASED_UNCONDITIONAL_IO_EXITING: u64 = 1 << 24;
        const PROCBASED_USE_MSR_BITMAPS: u64 = 0; // left unset: intercept every MSR
        const PROCBASED_CPUID_EXITING: u64 = 1 << 27; // reserved on some parts; see REDESIGN note below
        const EXIT_CTLS_HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;
        const ENTRY_CTLS_IA32E_MODE_GUEST: u64 = 1 << 9;
        const PROCBASED2_ENABLE_EPT: u64 = 1 << 1;
        const EPTP_MEMORY_TYPE_WRITE_BACK: u64 = 6;
        const EPTP_PAGE_WALK_LENGTH_4: u64 = 3 << 3;
        let _ = PROCBASED_USE_MSR_BITMAPS;
        let _ = PROCBASED_CPUID_EXITING;

        vmclear(&mut self.vmcs_region);
        self.vmcs_region.revision_id = self.vmxon_region.revision_id;
        vmptrld(&mut self.vmcs_region);

        self.host_gdt.initialize_from_current();
        let mut idtr = DescriptorTablePointer::<u64>::default();
        unsafe { x86::dtables::sidt(&mut idtr) };
        vmwrite(vmcs::host::CS_SELECTOR, self.host_gdt.cs.bits());
        vmwrite(vmcs::host::TR_SELECTOR, self.host_gdt.tr.bits());
        vmwrite(vmcs::host::CR0, cr0().bits() as u64);
        vmwrite(vmcs::host::CR3, unsafe { x86::controlregs::cr3() });
        vmwrite(vmcs::host::CR4, cr4().bits() as u64);
        vmwrite(vmcs::host::TR_BASE, self.host_gdt.tss.0.as_ptr() as u64);
        vmwrite(vmcs::host::GDTR_BASE, self.host_gdt.gdtr.base as u64);
        vmwrite(vmcs::host::IDTR_BASE, idtr.base as u64);

        vmwrite(
            vmcs::control::VMEXIT_CONTROLS,
            adjust_vmx_control(VmxControl::VmExit, EXIT_CTLS_HOST_ADDRESS_SPACE_SIZE),
        );
        vmwrite(
            vmcs::control::VMENTRY_CONTROLS,
            adjust_vmx_control(VmxControl::VmEntry, ENTRY_CTLS_IA32E_MODE_GUEST),
        );
        vmwrite(
            vmcs::control::PINBASED_EXEC_CONTROLS,
            adjust_vmx_control(
                VmxControl::PinBased,
                IA32_VMX_PINBASED_CTLS_ACTIVATE_VMX_PREEMPTION_TIMER_FLAG,
            ),
        );
        vmwrite(
            vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
            adjust_vmx_control(
                VmxControl::ProcessorBased,
                PROCBASED_ACTIVATE_SECONDARY_CONTROLS
                    | PROCBASED_HLT_EXITING
                    | PROCBASED_CR3_LOAD_EXITING
                    | PROCBASED_CR3_STORE_EXITING
                    | PROCBASED_CR8_LOAD_EXITING
                    | PROCBASED_CR8_STORE_EXITING
                    | PROCBASED_MOV_DR_EXITING
                    | PROCBASED_UNCONDITIONAL_IO_EXITING,
            ),
        );
        vmwrite(
            vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
            adjust_vmx_control(VmxControl::ProcessorBased2, PROCBASED2_ENABLE_EPT),
        );
        vmwrite(
            vmcs::control::EPTP_FULL,
            nested_pml4_addr | EPTP_PAGE_WALK_LENGTH_4 | EPTP_MEMORY_TYPE_WRITE_BACK,
        );
        vmwrite(
            vmcs::control::EXCEPTION_BITMAP,
            (1u64 << irq::BREAKPOINT_VECTOR)
                | (1u64 << irq::INVALID_OPCODE_VECTOR)
                | (1u64 << irq::PAGE_FAULT_VECTOR)
                | (1u64 << irq::GENERAL_PROTECTION_FAULT_VECTOR),
        );
        vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);
    }

    fn load_gprs(&mut self, registers: &GuestRegisters) {
        vmwrite(vmcs::guest::RIP, registers.rip);
        vmwrite(vmcs::guest::RSP, registers.rsp);
        vmwrite(vmcs::guest::RFLAGS, registers.rflags);
        self.registers = *registers;
        if let Some(timer_scale) = self.timer_scale {
            vmwrite(
                vmcs::guest::VMX_PREEMPTION_TIMER_VALUE,
                crate::config::VCPU_EXEC_TIMEOUT_IN_TSC / timer_scale,
            );
        }
    }

    fn view_gprs(&self) -> GuestRegisters {
        let mut registers = self.registers;
        registers.rip = vmread(vmcs::guest::RIP);
        registers.rsp = vmread(vmcs::guest::RSP);
        registers.rflags = vmread(vmcs::guest::RFLAGS);
        registers
    }

    fn load_register(&mut self, class: RegisterClass, value: u64) {
        match class {
            RegisterClass::Control => vmwrite(vmcs::guest::CR0, value),
            RegisterClass::Debug => vmwrite(vmcs::guest::DR7, value),
            RegisterClass::DescriptorTable => vmwrite(vmcs::guest::GDTR_BASE, value),
            RegisterClass::Efer => vmwrite(vmcs::guest::IA32_EFER_FULL, value),
            RegisterClass::Pat => vmwrite(vmcs::guest::IA32_PAT_FULL, value),
            RegisterClass::SysenterMsr => vmwrite(vmcs::guest::IA32_SYSENTER_ESP, value),
            RegisterClass::Xcr0 => self.xcr0 = value,
            _ => {}
        }
    }

    fn view_register(&self, class: RegisterClass) -> u64 {
        match class {
            RegisterClass::Control => vmread(vmcs::guest::CR0),
            RegisterClass::Debug => vmread(vmcs::guest::DR7),
            RegisterClass::DescriptorTable => vmread(vmcs::guest::GDTR_BASE),
            RegisterClass::Efer => vmread(vmcs::guest::IA32_EFER_FULL),
            RegisterClass::Pat => vmread(vmcs::guest::IA32_PAT_FULL),
            RegisterClass::SysenterMsr => vmread(vmcs::guest::IA32_SYSENTER_ESP),
            RegisterClass::Xcr0 => self.xcr0,
            _ => 0,
        }
    }

    fn run(&mut self) -> VendorExit {
        const VMX_EXIT_EXCEPTION_OR_NMI: u16 = 0;
        const VMX_EXIT_HLT: u16 = 12;
        const VMX_EXIT_CPUID: u16 = 10;
        const VMX_EXIT_TASK_SWITCH: u16 = 9;
        const VMX_EXIT_MOV_CR: u16 = 28;
        const VMX_EXIT_MOV_DR: u16 = 29;
        const VMX_EXIT_IO_INSTRUCTION: u16 = 30;
        const VMX_EXIT_RDMSR: u16 = 31;
        const VMX_EXIT_WRMSR: u16 = 32;
        const VMX_EXIT_TRIPLE_FAULT: u16 = 2;
        const VMX_EXIT_EPT_VIOLATION: u16 = 48;
        const VMX_EXIT_PREEMPTION_TIMER: u16 = 52;

        let flags = unsafe { run_vm_vmx(&mut self.registers, u64::from(self.launched)) };
        vm_succeed(flags).unwrap();
        self.launched = true;

        self.registers.rip = vmread(vmcs::guest::RIP);
        self.registers.rsp = vmread(vmcs::guest::RSP);
        self.registers.rflags = vmread(vmcs::guest::RFLAGS);

        match vmread(vmcs::ro::EXIT_REASON) as u16 {
            VMX_EXIT_EXCEPTION_OR_NMI => VendorExit::Exception(ExceptionContext {
                vector: vmread(vmcs::ro::VMEXIT_INTERRUPTION_INFO) as u8,
                error_code_valid: true,
                error_code: vmread(vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32,
                pf_addr: vmread(vmcs::ro::EXIT_QUALIFICATION),
            }),
            VMX_EXIT_EPT_VIOLATION => {
                let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
                VendorExit::NestedPageFault(NestedPageFaultQualification {
                    rip: self.registers.rip,
                    gpa: vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL),
                    missing_translation: (qualification & 0b11_1000) == 0,
                    write_access: (qualification & 0b10) != 0,
                })
            }
            VMX_EXIT_MOV_CR => {
                let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
                let cr_number = (qualification & 0xf) as u8;
                let access_type = (qualification >> 4) & 0b11;
                let gpr_number = ((qualification >> 8) & 0xf) as u8;
                VendorExit::CrAccess(cr_number, gpr_number, access_type == 0)
            }
            VMX_EXIT_MOV_DR => {
                let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
                let dr_number = (qualification & 0x7) as u8;
                let gpr_number = ((qualification >> 8) & 0xf) as u8;
                let write = (qualification & (1 << 4)) == 0;
                VendorExit::DrAccess(dr_number, gpr_number, write)
            }
            VMX_EXIT_IO_INSTRUCTION => {
                let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);
                VendorExit::Io(IoContext {
                    is_in: (qualification & (1 << 3)) != 0,
                    string: (qualification & (1 << 4)) != 0,
                    repeat: (qualification & (1 << 5)) != 0,
                    operand_size: (qualification & 0b111) as u8 + 1,
                    address_width: 64,
                    port: (qualification >> 16) as u16,
                    rax: self.registers.rax,
                    rcx: self.registers.rcx,
                    rsi: self.registers.rsi,
                    rdi: self.registers.rdi,
                })
            }
            VMX_EXIT_RDMSR | VMX_EXIT_WRMSR => VendorExit::Msr(
                MsrContext {
                    ecx: self.registers.rcx as u32,
                    eax: self.registers.rax as u32,
                    edx: self.registers.rdx as u32,
                },
                vmread(vmcs::ro::EXIT_REASON) as u16 == VMX_EXIT_WRMSR,
            ),
            VMX_EXIT_CPUID => VendorExit::Cpuid(self.registers.rax as u32, self.registers.rcx as u32),
            VMX_EXIT_HLT => VendorExit::Hlt,
            VMX_EXIT_TASK_SWITCH => VendorExit::TaskSwitch,
            VMX_EXIT_PREEMPTION_TIMER => VendorExit::ExternalInterruptOrPause,
            VMX_EXIT_TRIPLE_FAULT => VendorExit::Shutdown(u64::from(vmread(vmcs::ro::EXIT_REASON) as u16)),
            reason => VendorExit::Unexpected(u64::from(reason)),
        }
    }

    fn inject_event(&mut self, injection: EventInjection) {
        const VALID: u32 = 1 << 31;
        const DELIVER_ERROR_CODE: u32 = 1 << 11;

        let interruption_type: u32 = match injection.kind {
            EventKind::ExternalInterrupt => 0,
            EventKind::Nmi => 2,
            EventKind::HardwareException => 3,
            EventKind::SoftwareException => 6,
        };
        let mut info = u32::from(injection.vector) | (interruption_type << 8) | VALID;
        if injection.error_code_valid {
            info |= DELIVER_ERROR_CODE;
            vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, injection.error_code);
        }
        vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, info);
    }

    fn interrupt_window_open(&self) -> bool {
        vmread(vmcs::guest::INTERRUPTIBILITY_STATE) == 0
    }

    fn invalidate_nested_paging_caches(&mut self) {
        // Not required unless VPID is enabled (it is not here); caches are
        // always invalidated on VM-exit/VM-entry without it. Kept for
        // clarity and as a hook should VPID be added later.
        invept(vmread(vmcs::control::EPTP_FULL));
    }

    fn nps_entry_flags(&self, attrs: MappingAttributes) -> NestedEntryFlags {
        // See: Table 29-6. Format of an EPT Page-Table Entry that Maps a
        // 4-KByte Page.
        let mut permission = u8::from(attrs.present() != 0);
        permission |= u8::from(attrs.write() != 0) << 1;
        permission |= u8::from(attrs.execute() != 0) << 2;
        NestedEntryFlags { permission, memory_type: 6 }
    }
}

/// Region the logical processor uses to support VMX operation.
/// See: 25.11.5 VMXON Region
#[derive(derivative::Derivative)]
#[derivative(Default)]
#[repr(C, align(4096))]
struct Vmxon {
    revision_id: u32,
    #[derivative(Default(value = "[0; 4092]"))]
    data: [u8; 4092],
}
const _: () = assert!(core::mem::size_of::<Vmxon>() == 0x1000);

/// Region representing one virtual CPU. See: 25.2 FORMAT OF THE VMCS REGION
#[derive(derivative::Derivative)]
#[derivative(Default)]
#[repr(C, align(4096))]
struct Vmcs {
    revision_id: u32,
    abort_indicator: u32,
    #[derivative(Default(value = "[0; 4088]"))]
    data: [u8; 4088],
}
const _: () = assert!(core::mem::size_of::<Vmcs>() == 0x1000);

#[derive(Clone, Copy)]
enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// The collection of GDT-related data needed to manage the host GDT, cloned
/// from the currently running GDT with a task segment appended (required
/// since CS/TR cannot be the null selector in host state; the UEFI DXE phase
/// leaves TR null).
#[repr(C, align(16))]
struct HostGdt {
    gdt: Vec<u64>,
    gdtr: DescriptorTablePointer<u64>,
    tss: TaskStateSegment,
    tr: SegmentSelector,
    cs: SegmentSelector,
}

impl Default for HostGdt {
    fn default() -> Self {
        Self {
            gdt: Vec::new(),
            gdtr: DescriptorTablePointer::<u64>::default(),
            tss: TaskStateSegment([0; 104]),
            tr: SegmentSelector::from_raw(0),
            cs: SegmentSelector::from_raw(0),
        }
    }
}

impl HostGdt {
    fn initialize_from_current(&mut self) {
        let mut current_gdtr = DescriptorTablePointer::<u64>::default();
        unsafe { sgdt(&mut current_gdtr) };
        let current_gdt = unsafe {
            core::slice::from_raw_parts(
                current_gdtr.base.cast::<u64>(),
                usize::from(current_gdtr.limit + 1) / 8,
            )
        };
        self.gdt = current_gdt.to_vec();
        self.gdt.push(task_segment_descriptor(&self.tss));
        self.gdtr.base = self.gdt.as_ptr();
        self.gdtr.limit = u16::try_from(self.gdt.len() * 8 - 1).unwrap();
        let tr_index = self.gdt.len() as u16 - 1;
        self.tr = SegmentSelector::new(tr_index, x86::Ring::Ring0);
        self.cs = cs();
    }
}

/// See: Figure 8-11. 64-Bit TSS Format
struct TaskStateSegment([u8; 104]);

fn task_segment_descriptor(tss: &TaskStateSegment) -> u64 {
    let tss_size = core::mem::size_of::<TaskStateSegment>() as u64;
    let tss_base = core::ptr::from_ref::<TaskStateSegment>(tss) as u64;
    let tss_descriptor = <DescriptorBuilder as GateDescriptorBuilder<u32>>::tss_descriptor(
        tss_base,
        tss_size - 1,
        true,
    )
    .present()
    .dpl(x86::Ring::Ring0)
    .finish();
    unsafe { core::mem::transmute::<Descriptor, u64>(tss_descriptor) }
}

fn adjust_vmx_control(control: VmxControl, requested_value: u64) -> u64 {
    const TRUE_CONTROLS_FLAG: u64 = 1 << 55;
    let vmx_basic = rdmsr(msr::IA32_VMX_BASIC);
    let true_supported = (vmx_basic & TRUE_CONTROLS_FLAG) != 0;
    let cap_msr = match (control, true_supported) {
        (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
        (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
    };
    let capabilities = rdmsr(cap_msr);
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;
    let mut effective_value = u32::try_from(requested_value).unwrap_or(u32::MAX & requested_value as u32);
    effective_value |= allowed0;
    effective_value &= allowed1;
    u64::from(effective_value)
}

fn adjust_feature_control_msr() {
    const LOCK_BIT: u64 = 1 << 0;
    const ENABLE_VMX_OUTSIDE_SMX: u64 = 1 << 2;
    let feature_control = rdmsr(msr::IA32_FEATURE_CONTROL);
    if (feature_control & LOCK_BIT) == 0 {
        wrmsr(msr::IA32_FEATURE_CONTROL, feature_control | ENABLE_VMX_OUTSIDE_SMX | LOCK_BIT);
    }
}

fn adjust_cr0() {
    let fixed0 = rdmsr(msr::IA32_VMX_CR0_FIXED0);
    let fixed1 = rdmsr(msr::IA32_VMX_CR0_FIXED1);
    let mut new_cr0 = cr0().bits() as u64;
    new_cr0 &= fixed1;
    new_cr0 |= fixed0;
    cr0_write(Cr0::from_bits_truncate(new_cr0 as usize));
}

fn rdmsr(msr: u32) -> u64 {
    unsafe { msr::rdmsr(msr) }
}

fn wrmsr(msr: u32, value: u64) {
    unsafe { msr::wrmsr(msr, value) }
}

fn vmxon(region: &mut Vmxon) {
    unsafe { x86::bits64::vmx::vmxon(core::ptr::from_mut(region) as u64).unwrap() };
}

fn vmclear(region: &mut Vmcs) {
    unsafe { x86::bits64::vmx::vmclear(core::ptr::from_mut(region) as u64).unwrap() };
}

fn vmptrld(region: &mut Vmcs) {
    unsafe { x86::bits64::vmx::vmptrld(core::ptr::from_mut(region) as u64).unwrap() };
}

fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

fn vmwrite<T: Into<u64>>(field: u32, val: T) {
    unsafe { x86::bits64::vmx::vmwrite(field, val.into()) }.unwrap();
}

fn invept(eptp: u64) {
    #[repr(C)]
    struct InveptDescriptor {
        eptp: u64,
        _reserved: u64,
    }
    const SINGLE_CONTEXT: u64 = 1;
    let descriptor = InveptDescriptor { eptp, _reserved: 0 };
    let flags: u64;
    unsafe {
        asm!(
            "invept {}, [{}]",
            "pushfq",
            "pop {}",
            in(reg) SINGLE_CONTEXT,
            in(reg) &descriptor,
            lateout(reg) flags,
        );
    }
    vm_succeed(flags).expect("INVEPT failed");
}

fn vm_succeed(flags: u64) -> Result<(), u64> {
    const ZF: u64 = 1 << 6;
    const CF: u64 = 1 << 0;
    if flags & ZF != 0 {
        Err(vmread(vmcs::ro::VM_INSTRUCTION_ERROR))
    } else if flags & CF != 0 {
        Err(u64::MAX)
    } else {
        Ok(())
    }
}

impl fmt::Debug for Vmcs {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Vmcs")
            .field("revision_id", &self.revision_id)
            .field("guest_rip", &vmread(vmcs::guest::RIP))
            .field("exit_reason", &vmread(vmcs::ro::EXIT_REASON))
            .finish_non_exhaustive()
    }
}

/// Executes VMLAUNCH (first entry) or VMRESUME (subsequent entries),
/// loading/saving the software-managed GPRs around it; RFLAGS on return
/// indicates whether the instruction itself succeeded (see [`vm_succeed`]).
///
/// # Safety
/// A VMCS must already be current (VMPTRLD) and fully configured via
/// [`Vmx::initialize`] before the first call with `launched == 0`.
unsafe fn run_vm_vmx(registers: &mut GuestRegisters, launched: u64) -> u64 {
    let flags: u64;
    asm!(
        "push rbx", "push rbp", "push r12", "push r13", "push r14", "push r15",
        "mov rax, [{regs}]",
        "mov rbx, 8[{regs}]", "mov rcx, 16[{regs}]", "mov rdx, 24[{regs}]",
        "mov rdi, 32[{regs}]", "mov rsi, 40[{regs}]", "mov rbp, 48[{regs}]",
        "mov r8, 56[{regs}]", "mov r9, 64[{regs}]", "mov r10, 72[{regs}]",
        "mov r11, 80[{regs}]", "mov r12, 88[{regs}]", "mov r13, 96[{regs}]",
        "mov r14, 104[{regs}]", "mov r15, 112[{regs}]",
        "cmp {launched}, 0",
        "jne 2f",
        "vmlaunch",
        "jmp 3f",
        "2:",
        "vmresume",
        "3:",
        "mov [{regs}], rax",
        "mov 8[{regs}], rbx", "mov 16[{regs}], rcx", "mov 24[{regs}], rdx",
        "mov 32[{regs}], rdi", "mov 40[{regs}], rsi", "mov 48[{regs}], rbp",
        "mov 56[{regs}], r8", "mov 64[{regs}], r9", "mov 72[{regs}], r10",
        "mov 80[{regs}], r11", "mov 88[{regs}], r12", "mov 96[{regs}], r13",
        "mov 104[{regs}], r14", "mov 112[{regs}], r15",
        "pushfq",
        "pop {flags}",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop rbp", "pop rbx",
        regs = in(reg) registers,
        launched = in(reg) launched,
        flags = out(reg) flags,
        out("rax") _, out("rcx") _, out("rdx") _,
        out("rdi") _, out("rsi") _, out("r8") _, out("r9") _, out("r10") _, out("r11") _,
    );
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmxon_region_is_one_page() {
        assert_eq!(core::mem::size_of::<Vmxon>(), 0x1000);
    }

    #[test]
    fn nps_entry_flags_request_write_back_memory_type() {
        let vmx = Vmx::new();
        let attrs = MappingAttributes::new(true, false, true, crate::npt::PageSize::Size4K);
        let flags = vmx.nps_entry_flags(attrs);
        assert_eq!(flags.permission, 0b101);
        assert_eq!(flags.memory_type, 6);
    }

    #[test]
    fn xcr0_round_trips_through_the_software_shadow() {
        let mut vmx = Vmx::new();
        vmx.load_register(RegisterClass::Xcr0, 1);
        assert_eq!(vmx.view_register(RegisterClass::Xcr0), 1);
    }
}
