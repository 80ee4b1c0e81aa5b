//! Synthetic-hypervisor presence surface queried via `QueryHvStatus`.
//!
//! A full Hyper-V-compatible synthetic MSR/CPUID layer is an external
//! collaborator (out of scope); this module owns only the narrow set of
//! constants `QueryHvStatus` returns, mirroring
//! `noir_cvm_hvstatus_{presence,capabilities,hypercall_instruction}`.

/// CPUID leaf reporting the synthetic hypervisor's vendor signature
/// ("NoirVisor"/equivalent string is a collaborator concern; the core only
/// reserves the standard leaf number).
pub const CPUID_LEAF_HV_VENDOR_ID: u32 = 0x4000_0000;

/// CPUID leaf reporting synthetic-interface identification (`Hv#1`).
pub const CPUID_LEAF_HV_INTERFACE: u32 = 0x4000_0001;

/// The four `QueryHvStatus` sub-queries (mirrors `noir_cvm_hvstatus_type`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum HvStatusQuery {
    /// Whether the core is active on this processor at all.
    Presence = 0,
    /// The bitmask of CVM capabilities the core supports.
    Capabilities = 1,
    /// The raw bytes of the vendor-specific hypercall instruction.
    HypercallInstruction = 2,
}

bitfield::bitfield! {
    /// The capability bitmask `QueryHvStatus(Capabilities)` returns.
    #[derive(Clone, Copy)]
    pub struct CvmCapabilities(u64);
    impl Debug;
    u8;
    /// The core can intercept and service CPUID quickpath overrides.
    pub cpuid_quickpath, set_cpuid_quickpath: 0, 0;
    /// The core supports nested (guest-in-guest) virtualization.
    pub nested_virtualization, set_nested_virtualization: 1, 1;
    /// The core can report `InterceptCode::MonitorTrap` (VMX MTF).
    pub monitor_trap, set_monitor_trap: 2, 2;
}

impl CvmCapabilities {
    /// A capability set with every bit clear.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }
}

/// The vendor hypercall instruction's encoded bytes, as
/// `QueryHvStatus(HypercallInstruction)` returns them: a length byte
/// followed by up to 3 opcode bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HypercallInstruction {
    /// Number of valid bytes in `opcode`.
    pub length: u8,
    /// The instruction's encoded bytes, zero-padded.
    pub opcode: [u8; 3],
}

/// `VMCALL` (Intel VT-x): `0F 01 C1`.
pub const HYPERCALL_INSTRUCTION_VMX: HypercallInstruction =
    HypercallInstruction { length: 3, opcode: [0x0f, 0x01, 0xc1] };

/// `VMMCALL` (AMD SVM): `0F 01 D9`.
pub const HYPERCALL_INSTRUCTION_SVM: HypercallInstruction =
    HypercallInstruction { length: 3, opcode: [0x0f, 0x01, 0xd9] };

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_bits_are_independent() {
        let mut caps = CvmCapabilities(0);
        caps.set_monitor_trap(1);
        assert_eq!(caps.cpuid_quickpath(), 0);
        assert_eq!(caps.monitor_trap(), 1);
    }

    #[test]
    fn hypercall_instructions_differ_by_vendor() {
        assert_ne!(HYPERCALL_INSTRUCTION_VMX.opcode, HYPERCALL_INSTRUCTION_SVM.opcode);
        assert_eq!(HYPERCALL_INSTRUCTION_VMX.length, 3);
    }
}
