//! Machina - Kubernetes controller for externally managed virtual machines
//!
//! Machina watches `VirtualMachine` custom resources and converges a remote,
//! externally managed VM backend toward them: it attaches a protection
//! finalizer, creates (or adopts) the backing VM, mirrors the VM's live
//! status onto the resource, and tears the VM down before the resource is
//! allowed to disappear.
//!
//! # Architecture
//!
//! Machina is level-triggered: watch events only carry object *keys* onto a
//! deduplicating, rate-limited work queue, and every reconcile re-reads the
//! current state from a local cache. Redelivered or coalesced events are
//! therefore harmless. A periodic status-sync loop re-polls every known VM
//! independently of the event path, since CPU utilization changes without
//! anyone editing the spec.
//!
//! # Modules
//!
//! - [`crd`] - The VirtualMachine Custom Resource Definition
//! - [`queue`] - Deduplicating, rate-limited work queue
//! - [`manager`] - Remote VM backend capability trait and reference double
//! - [`controller`] - Reconciliation state machine, workers, status-sync loop
//! - [`informer`] - Watch-driven cache and the event adapter feeding the queue
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod informer;
pub mod manager;
pub mod queue;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized here so CRD helpers, runtime wiring, and test fixtures agree.

/// Finalizer token that blocks deletion of a VirtualMachine resource until
/// the backing remote VM has been torn down.
pub const VM_PROTECTION_FINALIZER: &str = "machina.dev/vm-protection";

/// Field-manager / component name used for API writes and events.
pub const CONTROLLER_NAME: &str = "machina-controller";

/// Default number of worker tasks draining the work queue.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default period of the status-sync loop.
pub const DEFAULT_STATUS_SYNC_PERIOD: std::time::Duration =
    std::time::Duration::from_secs(1);
