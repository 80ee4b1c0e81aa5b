//! The module containing the [`GlobalState`] type.

use crate::system_table::system_table_unsafe;
use core::sync::atomic::AtomicU64;
use cvm_core::Cvm;
use uefi::{
    proto::pi::mp::MpServices,
    table::boot::{OpenProtocolAttributes, OpenProtocolParams},
};

/// The singleton data structure shared across all processors. [`Cvm`] is
/// already safe for concurrent use from many logical processors (every
/// operation takes `&self`), so the only field that needs its own
/// synchronization here is the start-up barrier.
pub(crate) struct GlobalState {
    /// The number of logical processors that have entered
    /// [`crate::hypervisor::start_hypervisor`] so far.
    pub(crate) active_thread_count: AtomicU64,
    cvm: Cvm,
    vm_handle: u64,
    number_of_cores: u64,
}

impl GlobalState {
    pub(crate) fn new() -> Result<Self, uefi::Error> {
        // Safety: Code is single threaded.
        let st = unsafe { system_table_unsafe() };
        let bs = st.boot_services();
        let mp = unsafe {
            bs.open_protocol::<MpServices>(
                OpenProtocolParams {
                    handle: bs.get_handle_for_protocol::<MpServices>()?,
                    agent: bs.image_handle(),
                    controller: None,
                },
                OpenProtocolAttributes::GetProtocol,
            )?
        };

        let cvm = Cvm::new();
        let vm_handle = cvm.create_vm().expect("failed to create the initial VM");

        Ok(Self {
            active_thread_count: AtomicU64::new(0),
            cvm,
            vm_handle,
            number_of_cores: mp.get_number_of_processors()?.enabled as u64,
        })
    }

    pub(crate) fn cvm(&self) -> &Cvm {
        &self.cvm
    }

    pub(crate) fn vm_handle(&self) -> u64 {
        self.vm_handle
    }

    pub(crate) fn number_of_cores(&self) -> u64 {
        self.number_of_cores
    }
}
