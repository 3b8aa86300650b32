//! Controller implementation for the VirtualMachine CRD
//!
//! [`vm`] holds the per-key reconciliation state machine and the collaborator
//! seams it drives; [`runner`] owns the worker tasks and the periodic
//! status-sync loop.

mod runner;
mod vm;

pub use runner::{sync_all_statuses, ControllerConfig, VmController};
pub use vm::{
    reconcile, Context, EventRecorder, LogRecorder, VmLister, VmWriter, VmWriterImpl,
    MESSAGE_RESOURCE_SYNCED, SUCCESS_SYNCED,
};

pub(crate) use vm::update_vm_status;

#[cfg(test)]
pub(crate) use vm::{MockEventRecorder, MockVmLister, MockVmWriter};
