//! The module containing [`start_hypervisor`], the per-processor CVM
//! bring-up and world-switch loop.
//!
//! This crate is the boot-time driver that hosts the engine; the privileged
//! user-mode VM manager that would decide what to do with a `CPUID`/`IOIO`/
//! MMIO exit (load a guest image, answer a hypercall, emulate a device) sits
//! behind the IOCTL surface `cvm_core::Cvm` exposes and is an external
//! collaborator, not something this binary implements. So this loop's job is
//! to create one vCPU per logical processor, run it, and report what
//! happened; it does not attempt to service the exit itself.

use crate::{
    config::VCPU_PHYSICAL_TIMER_TICKS,
    global_state::GlobalState,
    x86_instructions::{cli, hlt, rdtsc},
};
use core::sync::atomic::Ordering;
use cvm_core::exit::InterceptCode;
use log::{info, trace, warn};

/// Brings the CVM engine up on the current processor and runs its
/// world-switch loop. Never returns.
pub(crate) fn start_hypervisor(global: &GlobalState) -> ! {
    let vp_index = global.active_thread_count.fetch_add(1, Ordering::SeqCst) as u32;
    let vm_handle = global.vm_handle();
    let cvm = global.cvm();

    info!("#{vp_index}: creating vCPU on VM {vm_handle:#x}");
    cvm.create_vcpu(vm_handle, vp_index)
        .expect("failed to create a vCPU for this processor");

    loop {
        let deadline = rdtsc().wrapping_add(VCPU_PHYSICAL_TIMER_TICKS);

        let context = match cvm.run_vcpu(vm_handle, vp_index) {
            Ok(context) => context,
            Err(status) => {
                warn!("#{vp_index}: run_vcpu failed: {status}");
                park();
            }
        };

        match context.intercept_code {
            // Ordinary, recurring guest behavior with nothing for an
            // unattended boot driver to act on; keep driving the vCPU.
            InterceptCode::HltInstruction
            | InterceptCode::InterruptWindow
            | InterceptCode::SingleStep
            | InterceptCode::MonitorTrap
            | InterceptCode::TaskSwitch => {
                trace!("#{vp_index}: {:?} at rip={:#x}", context.intercept_code, context.next_rip);
                if rdtsc() > deadline {
                    warn!("#{vp_index}: vCPU exceeded its physical-timer budget");
                    let _ = cvm.rescind_vcpu(vm_handle, vp_index);
                }
            }

            // Everything else needs a policy decision (load a guest image,
            // answer a CPUID/MSR/hypercall, emulate an MMIO/IO access) that
            // belongs to the user-mode VM manager on the other side of the
            // IOCTL surface. Report it and park; there is no manager
            // attached to this standalone boot image.
            other => {
                info!(
                    "#{vp_index}: {other:?} at rip={:#x} (no VM manager attached, parking)",
                    context.next_rip
                );
                park();
            }
        }
    }
}

/// Stops the current processor as much as possible.
fn park() -> ! {
    loop {
        cli();
        hlt();
    }
}
