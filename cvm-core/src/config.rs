//! The module containing various constants that may be modified by developers.
//!
//! Kept as plain `pub const` items, the way `rhv`'s own `config.rs` is a flat
//! module of tunables, so the boot crate can reference these without pulling
//! in any UEFI-specific type.

/// Number of pointer-sized slots in one handle-table node ("each
/// node is page-sized (512 pointers on 64-bit)").
pub const HANDLE_TABLE_FAN_OUT: usize = 512;

/// Number of index bits consumed per handle-table level (`log2` of
/// [`HANDLE_TABLE_FAN_OUT`]).
pub const HANDLE_TABLE_INDEX_BITS: u32 = 9;

/// Maximum number of per-VM CPUID quickpath overrides (mirrors `noir_cvm_cpuid_quickpath_limit_per_vm`).
pub const CPUID_QUICKPATH_LIMIT_PER_VM: usize = 64;

/// Maximum number of per-vCPU CPUID quickpath overrides (mirrors `noir_cvm_cpuid_quickpath_limit_per_vcpu`).
pub const CPUID_QUICKPATH_LIMIT_PER_VCPU: usize = 16;

/// Maximum number of locker-list entries (pinned host page batches) per VM.
pub const LOCKER_LIST_LIMIT_PER_VM: usize = 64;

/// Maximum number of memory-block registry entries per VM.
pub const MEMORY_BLOCK_LIMIT_PER_VM: usize = 64;

/// Preallocated pool size for nested paging structures (PML4/PDPT/PD/PT
/// nodes) per VM, generalized from `rhv`'s fixed `nested_paging_structures`
/// pool.
pub const NESTED_PAGING_STRUCTURE_POOL_SIZE: usize = 4096;

/// Number of bits of a guest-physical address consumed by one nested-paging
/// table level.
pub const NESTED_PAGING_LEVEL_INDEX_BITS: u32 = 9;

/// `RunVcpu`'s required-size header, returned when the caller's output
/// buffer is too small: 4 bytes required-size-low, 4 bytes
/// required-size-high, followed by the exit context.
pub const RUN_VCPU_SIZE_PREFIX_BYTES: usize = 8;

/// Logging level for the `log` facade; the UEFI boot crate reads this to
/// configure its sink the way `rhv`'s own `config::LOGGING_LEVEL` does.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Trace;
