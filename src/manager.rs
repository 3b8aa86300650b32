//! Remote VM backend abstraction
//!
//! The controller never holds authoritative state about remote VMs; it only
//! drives a backend through this capability set. Backends are pluggable
//! behind [`VmManager`]; [`FakeVmManager`] is the no-op reference double used
//! when no real backend is wired in, and must not be mistaken for production
//! behavior.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// A remote virtual machine as reported by the backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VmRecord {
    /// Opaque backend identity; empty means the VM has not been created yet
    pub id: String,
    /// VM name, matching the `spec.vmName` of the owning resource
    pub name: String,
}

/// Point-in-time VM status, queried on demand and never cached
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    /// Backend identity of the VM this status belongs to
    pub vm_id: String,
    /// CPU utilization as an integer percentage
    pub cpu_utilization: i32,
}

/// Errors reported by a VM backend
///
/// `AlreadyExists` and `NotFound` are distinguished variants because the
/// reconciler recovers from them locally (adoption and already-clean delete
/// respectively) instead of retrying.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    /// A VM with this name already exists in the backend
    #[error("vm '{0}' already exists")]
    AlreadyExists(String),

    /// No VM with this identity or name exists in the backend
    #[error("vm '{0}' not found")]
    NotFound(String),

    /// Any other backend failure; treated as transient and retried
    #[error("vm backend error: {0}")]
    Backend(String),
}

impl ManagerError {
    /// Create a generic backend error with the given message
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Returns true for the already-exists failure recovered via adoption
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Returns true for the not-found failure treated as already-clean
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Capability set every VM backend must implement
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VmManager: Send + Sync {
    /// Create a VM with the given name
    ///
    /// Must report [`ManagerError::AlreadyExists`] distinctly so callers can
    /// take the adoption path instead of failing.
    async fn create(&self, name: &str) -> Result<VmRecord, ManagerError>;

    /// List all VMs known to the backend
    async fn list(&self) -> Result<Vec<VmRecord>, ManagerError>;

    /// Fetch a single VM by its backend identity
    async fn get(&self, id: &str) -> Result<VmRecord, ManagerError>;

    /// Probe whether a VM name is valid/present in the backend
    ///
    /// Part of the backend contract; the reconcile flow itself does not
    /// currently call it.
    async fn check(&self, name: &str) -> Result<(), ManagerError>;

    /// Query the live status of a VM by its backend identity
    async fn get_status(&self, id: &str) -> Result<VmStatus, ManagerError>;

    /// Delete a VM by its backend identity
    async fn delete(&self, id: &str) -> Result<(), ManagerError>;
}

/// No-op reference backend
///
/// Returns empty records and zeroed status for everything. Stands in where a
/// deployment has not wired a real backend; a test double, not production
/// behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct FakeVmManager;

impl FakeVmManager {
    /// Create a new no-op backend
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VmManager for FakeVmManager {
    async fn create(&self, _name: &str) -> Result<VmRecord, ManagerError> {
        Ok(VmRecord::default())
    }

    async fn list(&self) -> Result<Vec<VmRecord>, ManagerError> {
        Ok(Vec::new())
    }

    async fn get(&self, _id: &str) -> Result<VmRecord, ManagerError> {
        Ok(VmRecord::default())
    }

    async fn check(&self, _name: &str) -> Result<(), ManagerError> {
        Ok(())
    }

    async fn get_status(&self, _id: &str) -> Result<VmStatus, ManagerError> {
        Ok(VmStatus::default())
    }

    async fn delete(&self, _id: &str) -> Result<(), ManagerError> {
        Ok(())
    }
}
