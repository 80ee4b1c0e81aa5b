//! The module containing various constants that may be modified by developers.
//!
//! `cvm_core::config` owns the platform-independent tunables (handle-table
//! fan-out, quickpath limits, nested-paging pool size); this module adds the
//! ones that are boot-environment knowledge.

/// The logging level. Re-exported from [`cvm_core::config`] so both crates
/// agree on one value without the core depending on this, UEFI-specific,
/// module.
pub(crate) const LOGGING_LEVEL: log::LevelFilter = cvm_core::config::LOGGING_LEVEL;

/// Upper bound, in TSC ticks, a vCPU may run before the physical timer fires
/// and the world-switch loop reports a rescission-worthy hang back to the
/// caller instead of resuming the guest again.
pub(crate) const VCPU_PHYSICAL_TIMER_TICKS: u64 = 200_000_000;
