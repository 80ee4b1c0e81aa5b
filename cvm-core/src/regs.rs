//! The module containing the register taxonomy and lazily-synchronized
//! state cache backing `edit_registers`/`view_registers`.
//!
//! The class list mirrors `noir_cvm_register_type` so the state cache's
//! bitmap has a concrete, exhaustive index space rather than an
//! approximation.

/// One independently-cached class of guest register state.
///
/// Each variant owns one bit in [`StateCache`]'s `valid`/`synchronized`
/// bitmaps, so editing or reading one class never disturbs the caching state
/// of another: reading or writing control registers never forces a
/// flush of the descriptor-table cache, and so on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RegisterClass {
    /// rax-r15, rip, rflags.
    GeneralPurpose = 0,
    /// rflags alone, when addressed independently of the GPR file.
    Flags,
    /// rip alone, when addressed independently of the GPR file.
    InstructionPointer,
    /// cr0, cr3, cr4.
    Control,
    /// cr2 (the faulting address register, cached apart from cr0/3/4 since
    /// it only matters on `#PF`).
    Cr2,
    /// dr0-dr3.
    Debug,
    /// dr6, dr7.
    Dr67,
    /// cs, ss, ds, es (the four non-FS/GS data/code segments).
    Segment,
    /// fs, gs, and `MSR_KERNEL_GS_BASE`.
    FsGs,
    /// gdtr, idtr.
    DescriptorTable,
    /// tr, ldtr.
    LdtrTr,
    /// `MSR_STAR`/`MSR_LSTAR`/`MSR_CSTAR`/`MSR_SFMASK`.
    SyscallMsr,
    /// `MSR_SYSENTER_CS/ESP/EIP`.
    SysenterMsr,
    /// cr8 / TPR.
    Cr8,
    /// The legacy FXSAVE area.
    FxState,
    /// The XSAVE area.
    XSaveArea,
    /// xcr0.
    Xcr0,
    /// `MSR_EFER`.
    Efer,
    /// `MSR_PAT`.
    Pat,
    /// Last-branch-record MSR group.
    LastBranchRecord,
    /// The time-stamp counter (and TSC offset/multiplier where applicable).
    TimeStampCounter,
}

/// Number of [`RegisterClass`] variants; the width of [`StateCache`]'s
/// bitmaps.
pub const REGISTER_CLASS_COUNT: usize = RegisterClass::TimeStampCounter as usize + 1;

/// Every [`RegisterClass`] variant, in discriminant order. Lets the exit
/// dispatcher and vCPU constructor iterate the whole cache without an
/// `unsafe` transmute from `u8`.
pub const ALL_CLASSES: [RegisterClass; REGISTER_CLASS_COUNT] = [
    RegisterClass::GeneralPurpose,
    RegisterClass::Flags,
    RegisterClass::InstructionPointer,
    RegisterClass::Control,
    RegisterClass::Cr2,
    RegisterClass::Debug,
    RegisterClass::Dr67,
    RegisterClass::Segment,
    RegisterClass::FsGs,
    RegisterClass::DescriptorTable,
    RegisterClass::LdtrTr,
    RegisterClass::SyscallMsr,
    RegisterClass::SysenterMsr,
    RegisterClass::Cr8,
    RegisterClass::FxState,
    RegisterClass::XSaveArea,
    RegisterClass::Xcr0,
    RegisterClass::Efer,
    RegisterClass::Pat,
    RegisterClass::LastBranchRecord,
    RegisterClass::TimeStampCounter,
];

/// The bitmap of which register-state sub-sections are valid and
/// synchronized.
///
/// - `valid(class)`: the class currently holds a value considered loaded
///   into VMCB/VMCS (or, for a class just edited by the owner, a value the
///   next vendor "load guest state" step has not yet pushed into hardware).
/// - `synchronized(class)`: the mirror equals the VMCB/VMCS contents for
///   this class; when `valid && !synchronized`, a read must call the vendor
///   back-end's `dump_vcpu_vmcb` to refresh the mirror before returning.
#[derive(Clone, Copy, Debug, Default)]
pub struct StateCache {
    valid: u32,
    synchronized: u32,
}

const _: () = assert!(REGISTER_CLASS_COUNT <= 32);

impl StateCache {
    /// Creates a state cache with nothing loaded and nothing synchronized.
    #[must_use]
    pub const fn new() -> Self {
        Self { valid: 0, synchronized: 0 }
    }

    /// Called by `edit_registers`: the mirror is now authoritative for
    /// `class`, so the class no longer needs a hardware read-back; clears
    /// the `valid` bit.
    pub fn on_edit(&mut self, class: RegisterClass) {
        self.valid &= !Self::mask(class);
    }

    /// Called by the exit dispatcher for register classes that are captured
    /// into the mirror unconditionally on every VMEXIT (GPRs, RIP, RFLAGS):
    /// marks the class both valid and synchronized, so a subsequent read
    /// never triggers an extra VMCB/VMCS access.
    pub fn on_exit_synced(&mut self, class: RegisterClass) {
        self.valid |= Self::mask(class);
        self.synchronized |= Self::mask(class);
    }

    /// Called by the exit dispatcher for register classes that remain
    /// loaded in hardware across the exit but are not eagerly copied back:
    /// marks the class valid but not synchronized, deferring the read-back
    /// until something actually asks for it.
    pub fn on_exit_loaded(&mut self, class: RegisterClass) {
        self.valid |= Self::mask(class);
        self.synchronized &= !Self::mask(class);
    }

    /// True when `view_registers` must call the vendor back-end's
    /// `dump_vcpu_vmcb` before returning `class`'s value.
    #[must_use]
    pub fn needs_readback(&self, class: RegisterClass) -> bool {
        (self.valid & Self::mask(class)) != 0 && (self.synchronized & Self::mask(class)) == 0
    }

    /// Called after a read-back completes: the mirror now matches hardware.
    pub fn mark_synchronized(&mut self, class: RegisterClass) {
        self.synchronized |= Self::mask(class);
    }

    const fn mask(class: RegisterClass) -> u32 {
        1 << (class as u8)
    }
}

/// The collection of the guest general-purpose register values, shared with
/// the vendor back-ends (the layout mirrors `rhv`'s own `GuestRegisters`).
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GuestRegisters {
    /// rax
    pub rax: u64,
    /// rbx
    pub rbx: u64,
    /// rcx
    pub rcx: u64,
    /// rdx
    pub rdx: u64,
    /// rdi
    pub rdi: u64,
    /// rsi
    pub rsi: u64,
    /// rbp
    pub rbp: u64,
    /// r8
    pub r8: u64,
    /// r9
    pub r9: u64,
    /// r10
    pub r10: u64,
    /// r11
    pub r11: u64,
    /// r12
    pub r12: u64,
    /// r13
    pub r13: u64,
    /// r14
    pub r14: u64,
    /// r15
    pub r15: u64,
    /// rip
    pub rip: u64,
    /// rsp
    pub rsp: u64,
    /// rflags
    pub rflags: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_clears_valid_so_no_readback_is_needed() {
        let mut cache = StateCache::new();
        cache.on_exit_loaded(RegisterClass::Debug);
        assert!(cache.needs_readback(RegisterClass::Debug));
        cache.on_edit(RegisterClass::Debug);
        assert!(!cache.needs_readback(RegisterClass::Debug));
    }

    #[test]
    fn exit_synced_never_requires_readback() {
        let mut cache = StateCache::new();
        cache.on_exit_synced(RegisterClass::GeneralPurpose);
        assert!(!cache.needs_readback(RegisterClass::GeneralPurpose));
    }

    #[test]
    fn readback_completion_clears_the_pending_flag() {
        let mut cache = StateCache::new();
        cache.on_exit_loaded(RegisterClass::Pat);
        assert!(cache.needs_readback(RegisterClass::Pat));
        cache.mark_synchronized(RegisterClass::Pat);
        assert!(!cache.needs_readback(RegisterClass::Pat));
    }

    #[test]
    fn classes_are_independent() {
        let mut cache = StateCache::new();
        cache.on_exit_loaded(RegisterClass::Debug);
        assert!(!cache.needs_readback(RegisterClass::Control));
    }

    #[test]
    fn all_classes_covers_every_variant_exactly_once() {
        assert_eq!(ALL_CLASSES.len(), REGISTER_CLASS_COUNT);
        for (i, class) in ALL_CLASSES.iter().enumerate() {
            assert_eq!(*class as usize, i);
        }
    }
}
