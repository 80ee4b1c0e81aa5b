//! The exit-classification taxonomy and the per-exit context the dispatcher
//! builds on every `VMEXIT`, generalized from the `noir_cvm_intercept_code`
//! enumeration to cover every intercept the core can report, not just the
//! handful a single vCPU loop needs.

use crate::regs::GuestRegisters;

/// Discriminant for [`ExitContext`]; mirrors `noir_cvm_intercept_code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum InterceptCode {
    /// The vCPU's architectural state failed a precondition check (XCR0
    /// reserved bits, FPU/AVX consistency).
    InvalidState = 0,
    /// Triple fault or other unrecoverable shutdown condition.
    ShutdownCondition = 1,
    /// NPT/EPT translation fault; the emulator runs.
    MemoryAccess = 2,
    /// `RSM` executed (VMX only intercepts this indirectly; see emulator).
    RsmInstruction = 3,
    /// `HLT` executed.
    HltInstruction = 4,
    /// Port I/O.
    IoInstruction = 5,
    /// `CPUID` executed with no quickpath override.
    CpuidInstruction = 6,
    /// `RDMSR` matching the intercepted MSR class.
    RdmsrInstruction = 7,
    /// `WRMSR` matching the intercepted MSR class.
    WrmsrInstruction = 8,
    /// Control-register access.
    CrAccess = 9,
    /// Debug-register access.
    DrAccess = 10,
    /// A hypercall (vCPU stops with the hypercall number in RAX).
    Hypercall = 11,
    /// An intercepted exception.
    Exception = 12,
    /// `rescind_vcpu` forced the vCPU out of the guest.
    Rescission = 13,
    /// The core delivered a previously-pending injection and the interrupt
    /// (or NMI) window has now opened.
    InterruptWindow = 14,
    /// A hardware task switch.
    TaskSwitch = 15,
    /// The one-shot "hidden TF" trap fired.
    SingleStep = 16,
    /// Monitor-trap-flag single-step (VMX) fired.
    MonitorTrap = 18,
    /// Scheduler-internal: the core decided to preempt the guest, not
    /// reported as a user-visible exit unless `run_vcpu`'s internal retry
    /// loop gives up.
    SchedulerExit = 0x8000_0000,
    /// Scheduler-internal: excessive `PAUSE` execution.
    SchedulerPause = 0x8000_0001,
    /// Scheduler-internal: an invariant the scheduler could not resolve.
    SchedulerBug = 0x8000_0002,
    /// Scheduler-internal: an NPT/EPT misconfiguration the guest cannot see.
    SchedulerNptMisconfig = 0x8000_0003,
}

/// Whether an exit is ever handed back to the owner thread from `run_vcpu`,
/// or whether the dispatcher loops internally ("Internal exits...
/// loop back into the guest without returning to the caller").
impl InterceptCode {
    /// True for the scheduler-internal codes that `run_vcpu` never returns
    /// to the caller.
    #[must_use]
    pub const fn is_internal(self) -> bool {
        matches!(
            self,
            InterceptCode::SchedulerExit
                | InterceptCode::SchedulerPause
                | InterceptCode::SchedulerNptMisconfig
        )
    }
}

/// Qualification data for [`InterceptCode::MemoryAccess`].
#[derive(Clone, Copy, Debug)]
pub struct MemoryAccessContext {
    /// The guest-physical address that failed translation.
    pub gpa: u64,
    /// Whether the faulting access was a write.
    pub write: bool,
    /// Whether the fault was due to a missing translation (as opposed to a
    /// permission violation on an existing one).
    pub missing_translation: bool,
}

/// Qualification data for [`InterceptCode::IoInstruction`] (mirrors `noir_cvm_io_context`).
#[derive(Clone, Copy, Debug)]
pub struct IoContext {
    /// `true` for IN, `false` for OUT.
    pub is_in: bool,
    /// String I/O (`INS`/`OUTS`).
    pub string: bool,
    /// `REP`-prefixed.
    pub repeat: bool,
    /// Operand size in bytes (1, 2, 4).
    pub operand_size: u8,
    /// Address-size attribute in bits (16, 32, 64), used to mask RSI/RDI.
    pub address_width: u8,
    /// The I/O port.
    pub port: u16,
    /// RAX at the time of the exit.
    pub rax: u64,
    /// RCX at the time of the exit (repeat count for string I/O).
    pub rcx: u64,
    /// RSI (string OUT source).
    pub rsi: u64,
    /// RDI (string IN destination).
    pub rdi: u64,
}

/// Qualification data for [`InterceptCode::CrAccess`] (mirrors `noir_cvm_cr_access_context`).
#[derive(Clone, Copy, Debug)]
pub struct CrAccessContext {
    /// The control-register number (0, 3, 4, or 8).
    pub cr_number: u8,
    /// The general-purpose register index supplying/receiving the value.
    pub gpr_number: u8,
    /// `true` for a `MOV`, `false` for `CLTS`/`LMSW` style accesses.
    pub mov_instruction: bool,
    /// `true` for a write (`MOV CRn, reg`), `false` for a read.
    pub write: bool,
}

/// Qualification data for [`InterceptCode::DrAccess`].
#[derive(Clone, Copy, Debug)]
pub struct DrAccessContext {
    /// The debug-register number.
    pub dr_number: u8,
    /// The general-purpose register index supplying/receiving the value.
    pub gpr_number: u8,
    /// `true` for a write.
    pub write: bool,
}

/// Qualification data for [`InterceptCode::Exception`].
#[derive(Clone, Copy, Debug)]
pub struct ExceptionContext {
    /// The exception vector.
    pub vector: u8,
    /// Whether `error_code` is meaningful for this vector.
    pub error_code_valid: bool,
    /// The hardware-pushed error code, if any.
    pub error_code: u32,
    /// The faulting address, valid only for `#PF`.
    pub pf_addr: u64,
}

/// Qualification data for [`InterceptCode::RdmsrInstruction`]/
/// [`InterceptCode::WrmsrInstruction`].
#[derive(Clone, Copy, Debug)]
pub struct MsrContext {
    /// ECX: the MSR index.
    pub ecx: u32,
    /// EAX (low 32 bits of the value for WRMSR, or the out-param for
    /// RDMSR).
    pub eax: u32,
    /// EDX (high 32 bits of the value).
    pub edx: u32,
}

/// Snapshot of architectural state carried on every exit, regardless of
/// `intercept_code` ("post-exit CS, RIP, RFLAGS, next RIP, and a
/// state snapshot").
#[derive(Clone, Copy, Debug, Default)]
pub struct ExitState {
    /// Current privilege level.
    pub cpl: u8,
    /// Protected-mode enable.
    pub pe: bool,
    /// Long mode active.
    pub lm: bool,
    /// Paging enabled.
    pub pg: bool,
    /// PAE enabled.
    pub pae: bool,
    /// Interrupt-shadow (one instruction after `STI`/`MOV SS`).
    pub interrupt_shadow: bool,
    /// Length in bytes of the instruction that caused the exit.
    pub instruction_length: u8,
    /// A pending interrupt the core has not yet been able to inject.
    pub pending_interrupt: Option<u8>,
}

/// The tagged union the dispatcher populates on every `VMEXIT` and
/// `run_vcpu` hands back to the caller.
#[derive(Clone, Copy, Debug)]
pub struct ExitContext {
    /// Which arm of the union is meaningful.
    pub intercept_code: InterceptCode,
    /// Guest general-purpose registers at the time of the exit.
    pub registers: GuestRegisters,
    /// CS selector at the time of the exit.
    pub cs: u16,
    /// The RIP to resume at if the core re-enters the guest without
    /// advancing past the faulting instruction.
    pub next_rip: u64,
    /// Always-present state snapshot.
    pub state: ExitState,
    /// `Some` exactly when `intercept_code == MemoryAccess`.
    pub memory: Option<MemoryAccessContext>,
    /// `Some` exactly when `intercept_code == IoInstruction`.
    pub io: Option<IoContext>,
    /// `Some` exactly when `intercept_code` is `CrAccess`.
    pub cr: Option<CrAccessContext>,
    /// `Some` exactly when `intercept_code` is `DrAccess`.
    pub dr: Option<DrAccessContext>,
    /// `Some` exactly when `intercept_code` is `Exception`.
    pub exception: Option<ExceptionContext>,
    /// `Some` exactly when `intercept_code` is `RdmsrInstruction` or
    /// `WrmsrInstruction`.
    pub msr: Option<MsrContext>,
    /// `Some` exactly when `intercept_code` is `CpuidInstruction`.
    pub cpuid_leaf: Option<(u32, u32)>,
    /// `Some` exactly when `intercept_code` is `Hypercall`: the hypercall
    /// number, taken from RAX.
    pub hypercall_number: Option<u64>,
}

impl ExitContext {
    /// Builds a minimal exit context carrying only the discriminant and
    /// always-present fields; callers fill in the matching `Option` field
    /// for their `intercept_code`.
    #[must_use]
    pub fn new(intercept_code: InterceptCode, registers: GuestRegisters, cs: u16) -> Self {
        Self {
            intercept_code,
            registers,
            cs,
            next_rip: registers.rip,
            state: ExitState::default(),
            memory: None,
            io: None,
            cr: None,
            dr: None,
            exception: None,
            msr: None,
            cpuid_leaf: None,
            hypercall_number: None,
        }
    }
}

/// A pending event to deliver at the next guest entry ("Event
/// injection").
#[derive(Clone, Copy, Debug)]
pub struct EventInjection {
    /// The vector to inject.
    pub vector: u8,
    /// The kind of event.
    pub kind: EventKind,
    /// Whether `error_code` should be pushed.
    pub error_code_valid: bool,
    /// The error code to push, if `error_code_valid`.
    pub error_code: u32,
}

/// The four injectable event kinds ().
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A maskable external interrupt.
    ExternalInterrupt,
    /// A non-maskable interrupt.
    Nmi,
    /// A hardware exception (`#PF`, `#GP`, ...).
    HardwareException,
    /// A software-originated exception (`INT3`, `INTO`).
    SoftwareException,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_codes_are_internal_only() {
        assert!(InterceptCode::SchedulerPause.is_internal());
        assert!(InterceptCode::SchedulerNptMisconfig.is_internal());
        assert!(!InterceptCode::HltInstruction.is_internal());
        assert!(!InterceptCode::Rescission.is_internal());
    }
}
