//! The module containing [`NsvStatus`], the CVM status-word type.
//!
//! Status is a raw 32-bit word: 2-bit severity, 6-bit facility, 24-bit code.
//! That bit-exact layout is kept because it crosses the IOCTL boundary
//! unchanged, but wrapped here in a typed value object with named
//! constructors for every status the core can produce.

use core::fmt;

bitfield::bitfield! {
    /// A 32-bit CVM status word: `severity:2 | facility:6 | code:24`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct NsvStatus(u32);
    impl Debug;
    u8;
    /// `00` success, `01` informational, `10` warning, `11` error.
    pub severity, set_severity: 31, 30;
    /// Subsystem that produced the status.
    pub facility, set_facility: 29, 24;
    u32;
    /// Facility-specific code.
    pub code, set_code: 23, 0;
}

impl NsvStatus {
    const fn make(severity: u8, facility: u8, code: u32) -> Self {
        let raw = ((severity as u32) << 30) | ((facility as u32) << 24) | (code & 0x00FF_FFFF);
        Self(raw)
    }

    /// Returns the raw 32-bit status word as sent across the IOCTL boundary.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Builds a status from its raw wire representation.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// True for [`Self::SUCCESS`] and the other non-fatal signals.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.severity() == SEVERITY_SUCCESS || self.severity() == SEVERITY_INFORMATIONAL
    }

    // Non-fatal signals (severity: success / informational).
    /// The call completed normally.
    pub const SUCCESS: Self = Self::make(SEVERITY_SUCCESS, FACILITY_GENERIC, 0);
    /// A second `rescind_vcpu` observed a rescission already pending.
    pub const ALREADY_RESCINDED: Self = Self::make(SEVERITY_INFORMATIONAL, FACILITY_GENERIC, 1);
    /// `deref` performed the final release; the caller should drop the handle.
    pub const DEREFERENCE_DESTROYING: Self =
        Self::make(SEVERITY_INFORMATIONAL, FACILITY_GENERIC, 2);
    /// The emulated instruction referenced two memory operands.
    pub const EMU_DUAL_MEMORY_OPERANDS: Self =
        Self::make(SEVERITY_INFORMATIONAL, FACILITY_EMULATOR, 3);

    // Fatal-for-the-call, recoverable-at-the-boundary signals.
    /// Unspecified failure.
    pub const UNSUCCESSFUL: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 1);
    /// Allocation or resource exhaustion.
    pub const INSUFFICIENT_RESOURCES: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 2);
    /// Requested behavior is not implemented.
    pub const NOT_IMPLEMENTED: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 3);
    /// A parameter failed validation.
    pub const INVALID_PARAMETER: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 4);
    /// No hardware-virtualization extension is present or enabled.
    pub const HYPERVISION_ABSENT: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 5);
    /// `create_vcpu` collided with an existing index in the same VM.
    pub const VCPU_ALREADY_CREATED: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 6);
    /// The caller-supplied output buffer is smaller than required.
    pub const BUFFER_TOO_SMALL: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 7);
    /// The vCPU handle does not name a live vCPU.
    pub const VCPU_NOT_EXIST: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 8);
    /// Locking a user page failed (would-be `#PF` under `lock_pages`).
    pub const USER_PAGE_VIOLATION: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 9);
    /// The guest-physical page targeted by the operation is not present.
    pub const GUEST_PAGE_ABSENT: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 10);
    /// The caller is not authorized to perform the operation.
    pub const ACCESS_DENIED: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 11);
    /// A vendor hardware consistency check failed.
    pub const HARDWARE_ERROR: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 12);
    /// The subsystem was used before `initialize`.
    pub const UNINITIALIZED: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 13);
    /// An RMT ownership-transition rule was violated.
    pub const NSV_VIOLATION: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 14);
    /// `release_vm` was called while the VM still owns a vCPU, or a
    /// `run_vcpu` against one of its vCPUs is in flight.
    pub const VM_BUSY: Self = Self::make(SEVERITY_ERROR, FACILITY_GENERIC, 15);

    // Facility-specific signals, surfaced during init or emulation.
    /// `enable()` was invoked on a non-Intel processor.
    pub const NOT_INTEL: Self = Self::make(SEVERITY_ERROR, FACILITY_VENDOR, 1);
    /// The processor advertises VMX but not EPT.
    pub const VMX_EPT_NOT_SUPPORTED: Self = Self::make(SEVERITY_ERROR, FACILITY_VENDOR, 2);
    /// `enable()` was invoked on a non-AMD processor.
    pub const NOT_AMD: Self = Self::make(SEVERITY_ERROR, FACILITY_VENDOR, 3);
    /// The processor advertises SVM but not NPT.
    pub const SVM_NPT_NOT_SUPPORTED: Self = Self::make(SEVERITY_ERROR, FACILITY_VENDOR, 4);
    /// The faulting bytes do not form an instruction the emulator supports.
    pub const EMU_NOT_EMULATABLE: Self = Self::make(SEVERITY_ERROR, FACILITY_EMULATOR, 1);
    /// The opcode byte(s) were not recognized at all.
    pub const EMU_UNKNOWN_INSTRUCTION: Self = Self::make(SEVERITY_ERROR, FACILITY_EMULATOR, 2);
}

const SEVERITY_SUCCESS: u8 = 0b00;
const SEVERITY_INFORMATIONAL: u8 = 0b01;
#[allow(dead_code)]
const SEVERITY_WARNING: u8 = 0b10;
const SEVERITY_ERROR: u8 = 0b11;

const FACILITY_GENERIC: u8 = 0;
const FACILITY_VENDOR: u8 = 1;
const FACILITY_EMULATOR: u8 = 2;

impl fmt::Display for NsvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NsvStatus(severity={}, facility={}, code={:#x})",
            self.severity(),
            self.facility(),
            self.code()
        )
    }
}

impl Default for NsvStatus {
    fn default() -> Self {
        Self::SUCCESS
    }
}

/// Result alias used throughout the crate for fallible CVM operations.
pub type NsvResult<T> = Result<T, NsvStatus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout_round_trips() {
        let raw = NsvStatus::NSV_VIOLATION.raw();
        assert_eq!(NsvStatus::from_raw(raw), NsvStatus::NSV_VIOLATION);
    }

    #[test]
    fn success_is_not_fatal() {
        assert!(NsvStatus::SUCCESS.is_success());
        assert!(NsvStatus::ALREADY_RESCINDED.is_success());
        assert!(!NsvStatus::UNSUCCESSFUL.is_success());
    }

    #[test]
    fn distinct_statuses_have_distinct_raw_values() {
        assert_ne!(NsvStatus::INVALID_PARAMETER.raw(), NsvStatus::NSV_VIOLATION.raw());
        assert_ne!(NsvStatus::NOT_INTEL.raw(), NsvStatus::NOT_AMD.raw());
    }
}
