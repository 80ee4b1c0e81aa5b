//! The module containing the [`Svm`] type, which implements the
//! [`super::HardwareVt`] trait for AMD processors.
//!
//! The Secure Virtual Machine (SVM) extension implements AMD Virtualization
//! (AMD-V), the hardware assisted virtualization technology on AMD processors.
//!
//! All references to external resources (denoted with "See:") refer to
//! "AMD64 Architecture Programmer's Manual Volume 2: System Programming"
//! Revision 3.40 (January 2023) at
//! <https://developer.amd.com/resources/developer-guides-manuals/> unless
//! otherwise stated.

use super::{HardwareVt, NestedPageFaultQualification, VendorExit};
use crate::exit::{EventKind, EventInjection, ExceptionContext, IoContext, MsrContext};
use crate::npt::{MappingAttributes, NestedEntryFlags};
use crate::regs::{GuestRegisters, RegisterClass};
use alloc::boxed::Box;
use core::arch::asm;
use core::ptr::addr_of;
use x86::{irq, msr};

/// SVM-specific data to represent one vCPU.
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
pub struct Svm {
    vmcb: Box<Vmcb>,
    #[derivative(Debug = "ignore")]
    host_state: Box<HostStateArea>,
    registers: GuestRegisters,
    /// `XCR0`. SVM has no VMCB field for it; the host has to restore it
    /// manually around `VMRUN`, same as the source's `rhv` does with a
    /// plain save/restore rather than the VMCB-equivalent of auto-switching.
    xcr0: u64,
}

impl Svm {
    /// Creates an (uninitialized) SVM vCPU backend.
    #[must_use]
    pub fn new() -> Self {
        let vmcb = unsafe { Box::<Vmcb>::new_zeroed().assume_init() };
        let host_state = unsafe { Box::<HostStateArea>::new_zeroed().assume_init() };
        Self { vmcb, host_state, registers: GuestRegisters::default() }
    }
}

impl HardwareVt for Svm {
    /// Enables SVM on the current processor.
    fn enable(&mut self) {
        const EFER_SVME: u64 = 1 << 12;

        // See: 15.4 Enabling SVM
        unsafe { msr::wrmsr(msr::IA32_EFER, msr::rdmsr(msr::IA32_EFER) | EFER_SVME) };
    }

    /// Intercepts the full customizable-VM exit taxonomy: CR/DR access, the
    /// exception set the guest can be configured to trap, port I/O, RDMSR,
    /// WRMSR, CPUID, HLT, INTR, PAUSE, shutdown, and task switch. Enables
    /// nested paging.
    fn initialize(&mut self, nested_pml4_addr: u64) {
        const SVM_INTERCEPT_MISC1_INTR: u32 = 1 << 0;
        const SVM_INTERCEPT_MISC1_PAUSE: u32 = 1 << 23;
        const SVM_INTERCEPT_MISC1_HLT: u32 = 1 << 24;
        const SVM_INTERCEPT_MISC1_SHUTDOWN: u32 = 1 << 31;
        const SVM_INTERCEPT_MISC1_CPUID: u32 = 1 << 18;
        const SVM_INTERCEPT_MISC2_VMRUN: u32 = 1 << 0;
        const SVM_INTERCEPT_MISC2_RDMSR_WRMSR: u32 = 1 << 1;
        const SVM_INTERCEPT_MISC2_TASK_SWITCH: u32 = 1 << 2;
        const SVM_NP_ENABLE: u64 = 1 << 0;
        const SVM_MSR_VM_HSAVE_PA: u32 = 0xc001_0117;

        // See: 15.5.1 Basic Operation
        unsafe { msr::wrmsr(SVM_MSR_VM_HSAVE_PA, addr_of!(*self.host_state) as u64) };

        self.vmcb.control_area.intercept_cr_read = 0xffff;
        self.vmcb.control_area.intercept_cr_write = 0xffff;
        self.vmcb.control_area.intercept_dr_read = 0xffff;
        self.vmcb.control_area.intercept_dr_write = 0xffff;
        self.vmcb.control_area.intercept_misc1 = SVM_INTERCEPT_MISC1_INTR
            | SVM_INTERCEPT_MISC1_PAUSE
            | SVM_INTERCEPT_MISC1_HLT
            | SVM_INTERCEPT_MISC1_CPUID
            | SVM_INTERCEPT_MISC1_SHUTDOWN;
        self.vmcb.control_area.intercept_misc2 = SVM_INTERCEPT_MISC2_VMRUN
            | SVM_INTERCEPT_MISC2_RDMSR_WRMSR
            | SVM_INTERCEPT_MISC2_TASK_SWITCH;
        self.vmcb.control_area.pause_filter_count = u16::MAX;

        // See: 15.16 TLB Control
        self.vmcb.control_area.guest_asid = 1;

        // See: 15.25.3 Enabling Nested Paging
        self.vmcb.control_area.np_enable = SVM_NP_ENABLE;
        self.vmcb.control_area.ncr3 = nested_pml4_addr;

        // Every MSR is intercepted by leaving `msrpm_base_pa` unset (zero
        // maps to no permission bitmap installed, which SVM treats as
        // "intercept everything" once `SVM_INTERCEPT_MISC2_RDMSR_WRMSR` is
        // set without a bitmap address). See: 15.11 MSR Intercepts.
        self.vmcb.control_area.msrpm_base_pa = 0;

        // Exceptions the exit dispatcher may be asked to trap ().
        self.vmcb.control_area.intercept_exception = (1u32 << irq::BREAKPOINT_VECTOR)
            | (1u32 << irq::INVALID_OPCODE_VECTOR)
            | (1u32 << irq::PAGE_FAULT_VECTOR)
            | (1u32 << irq::GENERAL_PROTECTION_FAULT_VECTOR);
    }

    fn load_gprs(&mut self, registers: &GuestRegisters) {
        self.vmcb.state_save_area.rax = registers.rax;
        self.vmcb.state_save_area.rip = registers.rip;
        self.vmcb.state_save_area.rsp = registers.rsp;
        self.vmcb.state_save_area.rflags = registers.rflags;
        self.registers = *registers;
        self.registers.rax = registers.rax;
    }

    fn view_gprs(&self) -> GuestRegisters {
        let mut registers = self.registers;
        registers.rax = self.vmcb.state_save_area.rax;
        registers.rip = self.vmcb.state_save_area.rip;
        registers.rsp = self.vmcb.state_save_area.rsp;
        registers.rflags = self.vmcb.state_save_area.rflags;
        registers
    }

    fn load_register(&mut self, class: RegisterClass, value: u64) {
        match class {
            RegisterClass::Control => self.vmcb.state_save_area.cr0 = value,
            RegisterClass::Cr2 => self.vmcb.state_save_area.cr2 = value,
            RegisterClass::Cr8 => { /* SVM exposes CR8 via VTPR, not modeled yet */ }
            RegisterClass::Debug => self.vmcb.state_save_area.dr7 = value,
            RegisterClass::Dr67 => self.vmcb.state_save_area.dr6 = value,
            RegisterClass::DescriptorTable => self.vmcb.state_save_area.gdtr_base = value,
            RegisterClass::Efer => self.vmcb.state_save_area.efer = value | (1 << 12),
            RegisterClass::Pat => self.vmcb.state_save_area.gpat = value,
            RegisterClass::Xcr0 => self.xcr0 = value,
            _ => {}
        }
    }

    fn view_register(&self, class: RegisterClass) -> u64 {
        match class {
            RegisterClass::Control => self.vmcb.state_save_area.cr0,
            RegisterClass::Cr2 => self.vmcb.state_save_area.cr2,
            RegisterClass::Debug => self.vmcb.state_save_area.dr7,
            RegisterClass::Dr67 => self.vmcb.state_save_area.dr6,
            RegisterClass::DescriptorTable => self.vmcb.state_save_area.gdtr_base,
            RegisterClass::Efer => self.vmcb.state_save_area.efer,
            RegisterClass::Pat => self.vmcb.state_save_area.gpat,
            RegisterClass::Xcr0 => self.xcr0,
            _ => 0,
        }
    }

    fn run(&mut self) -> VendorExit {
        const VMEXIT_EXCP0: u64 = 0x40;
        const VMEXIT_EXCP31: u64 = 0x5f;
        const VMEXIT_CR0_READ: u64 = 0x00;
        const VMEXIT_CR15_READ: u64 = 0x0f;
        const VMEXIT_CR0_WRITE: u64 = 0x10;
        const VMEXIT_CR15_WRITE: u64 = 0x1f;
        const VMEXIT_DR0_READ: u64 = 0x20;
        const VMEXIT_DR15_READ: u64 = 0x2f;
        const VMEXIT_DR0_WRITE: u64 = 0x30;
        const VMEXIT_DR15_WRITE: u64 = 0x3f;
        const VMEXIT_INTR: u64 = 0x60;
        const VMEXIT_PAUSE: u64 = 0x77;
        const VMEXIT_HLT: u64 = 0x78;
        const VMEXIT_IOIO: u64 = 0x7b;
        const VMEXIT_MSR: u64 = 0x7c;
        const VMEXIT_TASK_SWITCH: u64 = 0x7d;
        const VMEXIT_SHUTDOWN: u64 = 0x7f;
        const VMEXIT_CPUID: u64 = 0x72;
        const VMEXIT_NPF: u64 = 0x400;

        unsafe { run_vm_svm(&mut self.registers, addr_of!(*self.vmcb) as u64) };

        self.registers.rax = self.vmcb.state_save_area.rax;
        self.registers.rip = self.vmcb.state_save_area.rip;
        self.registers.rsp = self.vmcb.state_save_area.rsp;
        self.registers.rflags = self.vmcb.state_save_area.rflags;
        self.vmcb.control_area.tlb_control = 0;

        let exit_code = self.vmcb.control_area.exit_code;
        match exit_code {
            VMEXIT_EXCP0..=VMEXIT_EXCP31 => VendorExit::Exception(ExceptionContext {
                vector: (exit_code - VMEXIT_EXCP0) as u8,
                error_code_valid: true,
                error_code: self.vmcb.control_area.exit_info1 as u32,
                pf_addr: self.vmcb.control_area.exit_info2,
            }),
            VMEXIT_NPF => VendorExit::NestedPageFault(NestedPageFaultQualification {
                rip: self.registers.rip,
                gpa: self.vmcb.control_area.exit_info2,
                missing_translation: (self.vmcb.control_area.exit_info1 & 0b1) == 0,
                write_access: (self.vmcb.control_area.exit_info1 & 0b10) != 0,
            }),
            VMEXIT_CR0_READ..=VMEXIT_CR15_READ => VendorExit::CrAccess(
                (exit_code - VMEXIT_CR0_READ) as u8,
                self.vmcb.control_area.exit_info1 as u8 & 0xf,
                false,
            ),
            VMEXIT_CR0_WRITE..=VMEXIT_CR15_WRITE => VendorExit::CrAccess(
                (exit_code - VMEXIT_CR0_WRITE) as u8,
                self.vmcb.control_area.exit_info1 as u8 & 0xf,
                true,
            ),
            VMEXIT_DR0_READ..=VMEXIT_DR15_READ => VendorExit::DrAccess(
                (exit_code - VMEXIT_DR0_READ) as u8,
                self.vmcb.control_area.exit_info1 as u8 & 0xf,
                false,
            ),
            VMEXIT_DR0_WRITE..=VMEXIT_DR15_WRITE => VendorExit::DrAccess(
                (exit_code - VMEXIT_DR0_WRITE) as u8,
                self.vmcb.control_area.exit_info1 as u8 & 0xf,
                true,
            ),
            VMEXIT_IOIO => {
                let info = self.vmcb.control_area.exit_info1;
                VendorExit::Io(IoContext {
                    is_in: (info & 1) != 0,
                    string: (info & (1 << 2)) != 0,
                    repeat: (info & (1 << 3)) != 0,
                    operand_size: if info & (1 << 4) != 0 {
                        1
                    } else if info & (1 << 5) != 0 {
                        2
                    } else {
                        4
                    },
                    address_width: if info & (1 << 7) != 0 {
                        16
                    } else if info & (1 << 8) != 0 {
                        32
                    } else {
                        64
                    },
                    port: (info >> 16) as u16,
                    rax: self.registers.rax,
                    rcx: self.registers.rcx,
                    rsi: self.registers.rsi,
                    rdi: self.registers.rdi,
                })
            }
            VMEXIT_MSR => VendorExit::Msr(
                MsrContext {
                    ecx: self.registers.rcx as u32,
                    eax: self.registers.rax as u32,
                    edx: self.registers.rdx as u32,
                },
                self.vmcb.control_area.exit_info1 == 1,
            ),
            VMEXIT_CPUID => VendorExit::Cpuid(self.registers.rax as u32, self.registers.rcx as u32),
            VMEXIT_HLT => VendorExit::Hlt,
            VMEXIT_TASK_SWITCH => VendorExit::TaskSwitch,
            VMEXIT_INTR | VMEXIT_PAUSE => VendorExit::ExternalInterruptOrPause,
            VMEXIT_SHUTDOWN => VendorExit::Shutdown(exit_code),
            _ => VendorExit::Unexpected(exit_code),
        }
    }

    fn inject_event(&mut self, injection: EventInjection) {
        const EVENTINJ_VALID: u64 = 1 << 31;
        const EVENTINJ_ERR_VALID: u64 = 1 << 11;

        let event_type: u64 = match injection.kind {
            EventKind::ExternalInterrupt => 0,
            EventKind::Nmi => 2,
            EventKind::HardwareException => 3,
            EventKind::SoftwareException => 4,
        };
        let mut event_inj = u64::from(injection.vector) | (event_type << 8) | EVENTINJ_VALID;
        if injection.error_code_valid {
            event_inj |= EVENTINJ_ERR_VALID | (u64::from(injection.error_code) << 32);
        }
        self.vmcb.control_area.event_inj = event_inj;
    }

    fn interrupt_window_open(&self) -> bool {
        self.vmcb.control_area.interrupt_shadow == 0
    }

    fn invalidate_nested_paging_caches(&mut self) {
        // See: Table 15-9. TLB Control Byte Encodings
        self.vmcb.control_area.tlb_control = 0b11;
    }

    fn nps_entry_flags(&self, attrs: MappingAttributes) -> NestedEntryFlags {
        // SVM uses the standard paging-structure-entry layout for nested
        // paging entries. Leaving PWT/PCD/PAT at zero yields the write-back
        // memory type.
        let mut permission = u8::from(attrs.present() != 0);
        permission |= u8::from(attrs.write() != 0) << 1;
        permission |= u8::from(attrs.execute() != 0) << 2;
        NestedEntryFlags { permission, memory_type: 0 }
    }
}

/// The virtual machine control block (VMCB). See: Appendix B Layout of VMCB
#[derive(Debug, Default)]
#[repr(C, align(4096))]
struct Vmcb {
    control_area: ControlArea,
    state_save_area: StateSaveArea,
}
const _: () = assert!(core::mem::size_of::<Vmcb>() == 0x1000);

/// See: Table B-1. VMCB Layout, Control Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct ControlArea {
    intercept_cr_read: u16,
    intercept_cr_write: u16,
    intercept_dr_read: u16,
    intercept_dr_write: u16,
    intercept_exception: u32,
    intercept_misc1: u32,
    intercept_misc2: u32,
    intercept_misc3: u32,
    #[derivative(Debug = "ignore", Default(value = "[0; 36]"))]
    _padding1: [u8; 0x03c - 0x018],
    pause_filter_threshold: u16,
    pause_filter_count: u16,
    iopm_base_pa: u64,
    msrpm_base_pa: u64,
    tsc_offset: u64,
    guest_asid: u32,
    tlb_control: u32,
    vintr: u64,
    interrupt_shadow: u64,
    exit_code: u64,
    exit_info1: u64,
    exit_info2: u64,
    exit_int_info: u64,
    np_enable: u64,
    avic_apic_bar: u64,
    guest_pa_pf_ghcb: u64,
    event_inj: u64,
    ncr3: u64,
    lbr_virtualization_enable: u64,
    vmcb_clean: u64,
    nrip: u64,
    num_of_bytes_fetched: u8,
    guest_instruction_bytes: [u8; 15],
    avic_apic_backing_page_pointer: u64,
    #[derivative(Debug = "ignore")]
    _padding2: u64,
    avic_logical_table_pointer: u64,
    avic_physical_table_pointer: u64,
    #[derivative(Debug = "ignore")]
    _padding3: u64,
    vmcb_save_state_pointer: u64,
    #[derivative(Debug = "ignore", Default(value = "[0; 720]"))]
    _padding4: [u8; 0x3e0 - 0x110],
    reserved_for_host: [u8; 0x20],
}
const _: () = assert!(core::mem::size_of::<ControlArea>() == 0x400);

/// See: Table B-2. VMCB Layout, State Save Area
#[derive(derivative::Derivative)]
#[derivative(Debug, Default)]
#[repr(C)]
struct StateSaveArea {
    es_selector: u16,
    es_attrib: u16,
    es_limit: u32,
    es_base: u64,
    cs_selector: u16,
    cs_attrib: u16,
    cs_limit: u32,
    cs_base: u64,
    ss_selector: u16,
    ss_attrib: u16,
    ss_limit: u32,
    ss_base: u64,
    ds_selector: u16,
    ds_attrib: u16,
    ds_limit: u32,
    ds_base: u64,
    fs_selector: u16,
    fs_attrib: u16,
    fs_limit: u32,
    fs_base: u64,
    gs_selector: u16,
    gs_attrib: u16,
    gs_limit: u32,
    gs_base: u64,
    gdtr_selector: u16,
    gdtr_attrib: u16,
    gdtr_limit: u32,
    gdtr_base: u64,
    ldtr_selector: u16,
    ldtr_attrib: u16,
    ldtr_limit: u32,
    ldtr_base: u64,
    idtr_selector: u16,
    idtr_attrib: u16,
    idtr_limit: u32,
    idtr_base: u64,
    tr_selector: u16,
    tr_attrib: u16,
    tr_limit: u32,
    tr_base: u64,
    #[derivative(Debug = "ignore", Default(value = "[0; 43]"))]
    _padding1: [u8; 0x0cb - 0x0a0],
    cpl: u8,
    #[derivative(Debug = "ignore")]
    _padding2: u32,
    efer: u64,
    #[derivative(Debug = "ignore", Default(value = "[0; 112]"))]
    _padding3: [u8; 0x148 - 0x0d8],
    cr4: u64,
    cr3: u64,
    cr0: u64,
    dr7: u64,
    dr6: u64,
    rflags: u64,
    rip: u64,
    #[derivative(Debug = "ignore", Default(value = "[0; 88]"))]
    _padding4: [u8; 0x1d8 - 0x180],
    rsp: u64,
    s_cet: u64,
    ssp: u64,
    isst_addr: u64,
    rax: u64,
    star: u64,
    lstar: u64,
    cstar: u64,
    sf_mask: u64,
    kernel_gs_base: u64,
    sysenter_cs: u64,
    sysenter_esp: u64,
    sysenter_eip: u64,
    cr2: u64,
    #[derivative(Debug = "ignore", Default(value = "[0; 32]"))]
    _padding5: [u8; 0x268 - 0x248],
    gpat: u64,
    dbg_ctl: u64,
    br_from: u64,
    br_to: u64,
    last_excep_from: u64,
    last_excep_to: u64,
    #[derivative(Debug = "ignore", Default(value = "[0; 71]"))]
    _padding6: [u8; 0x2df - 0x298],
    spec_ctl: u64,
}
const _: () = assert!(core::mem::size_of::<StateSaveArea>() == 0x2e8);

/// 4 KiB block where the host state is saved on VMRUN and restored on
/// #VMEXIT. See: 15.30.4 VM_HSAVE_PA MSR (C001_0117h)
#[allow(clippy::doc_markdown)]
#[repr(C, align(4096))]
struct HostStateArea([u8; 0x1000]);
const _: () = assert!(core::mem::size_of::<HostStateArea>() == 0x1000);

impl Default for HostStateArea {
    fn default() -> Self {
        Self([0; 4096])
    }
}

/// Saves every host GPR aside from RAX/RSP (managed by the VMCB and the
/// stack pointer respectively), loads the guest's from `registers`, and
/// executes VMRUN; on #VMEXIT, restores the host GPRs and writes the
/// guest's back into `registers`.
///
/// # Safety
/// `guest_vmcb_pa` must be the physical address of a fully initialized
/// [`Vmcb`] for the current logical processor, and SVM must already be
/// enabled ([`Svm::enable`]) and configured ([`Svm::initialize`]).
unsafe fn run_vm_svm(registers: &mut GuestRegisters, guest_vmcb_pa: u64) {
    asm!(
        "push rbx", "push rbp", "push r12", "push r13", "push r14", "push r15",
        "mov rax, [{regs}]",
        "mov rbx, 8[{regs}]", "mov rcx, 16[{regs}]", "mov rdx, 24[{regs}]",
        "mov rdi, 32[{regs}]", "mov rsi, 40[{regs}]", "mov rbp, 48[{regs}]",
        "mov r8, 56[{regs}]", "mov r9, 64[{regs}]", "mov r10, 72[{regs}]",
        "mov r11, 80[{regs}]", "mov r12, 88[{regs}]", "mov r13, 96[{regs}]",
        "mov r14, 104[{regs}]", "mov r15, 112[{regs}]",
        "vmload rax",
        "mov rax, {vmcb_pa}",
        "vmrun rax",
        "vmsave rax",
        "mov [{regs}], rax",
        "mov 8[{regs}], rbx", "mov 16[{regs}], rcx", "mov 24[{regs}], rdx",
        "mov 32[{regs}], rdi", "mov 40[{regs}], rsi", "mov 48[{regs}], rbp",
        "mov 56[{regs}], r8", "mov 64[{regs}], r9", "mov 72[{regs}], r10",
        "mov 80[{regs}], r11", "mov 88[{regs}], r12", "mov 96[{regs}], r13",
        "mov 104[{regs}], r14", "mov 112[{regs}], r15",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop rbp", "pop rbx",
        regs = in(reg) registers,
        vmcb_pa = in(reg) guest_vmcb_pa,
        out("rax") _, out("rcx") _, out("rdx") _,
        out("rdi") _, out("rsi") _, out("r8") _, out("r9") _, out("r10") _, out("r11") _,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmcb_control_area_is_exactly_one_kib() {
        assert_eq!(core::mem::size_of::<ControlArea>(), 0x400);
    }

    #[test]
    fn nps_entry_flags_set_no_memory_type_bits() {
        let svm = Svm::new();
        let attrs = MappingAttributes::new(true, true, true, crate::npt::PageSize::Size4K);
        let flags = svm.nps_entry_flags(attrs);
        assert_eq!(flags.permission, 0b111);
        assert_eq!(flags.memory_type, 0);
    }

    #[test]
    fn xcr0_round_trips_through_the_software_shadow() {
        let mut svm = Svm::new();
        svm.load_register(RegisterClass::Xcr0, 1);
        assert_eq!(svm.view_register(RegisterClass::Xcr0), 1);
    }
}
