//! Error types for the Machina controller

use thiserror::Error;

use crate::manager::ManagerError;

/// Main error type for Machina operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Remote VM backend error
    #[error("vm manager error: {0}")]
    Manager(#[from] ManagerError),

    /// A work-queue item that is not a valid `namespace/name` key
    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    /// A status sync was requested but no VM identity could be resolved
    #[error("no vm id found for '{0}'")]
    MissingVmId(String),

    /// Adoption failed: the backend reported the VM exists but listing
    /// could not locate it by name
    #[error("vm '{0}' not found in manager list")]
    VmNotInList(String),
}

impl Error {
    /// Create an invalid-key error for the given work-queue item
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey(key.into())
    }

    /// Create a missing-vm-id error for the given object key
    pub fn missing_vm_id(key: impl Into<String>) -> Self {
        Self::MissingVmId(key.into())
    }

    /// Create an adoption-miss error for the given VM name
    pub fn vm_not_in_list(name: impl Into<String>) -> Self {
        Self::VmNotInList(name.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Errors carry enough context to act on from a retry log line alone:
    /// the offending key or VM name is always part of the message.
    #[test]
    fn messages_name_the_offending_resource() {
        let err = Error::invalid_key("too/many/segments");
        assert!(err.to_string().contains("too/many/segments"));

        let err = Error::missing_vm_id("default/web-1");
        assert!(err.to_string().contains("no vm id found"));
        assert!(err.to_string().contains("default/web-1"));

        let err = Error::vm_not_in_list("web-1");
        assert!(err.to_string().contains("not found in manager list"));
    }

    /// Backend errors convert into the controller error so `?` works across
    /// the manager seam, and the variant stays matchable for retry policy.
    #[test]
    fn manager_errors_convert_and_stay_matchable() {
        let err: Error = ManagerError::backend("connection refused").into();
        assert!(err.to_string().contains("vm manager error"));
        match err {
            Error::Manager(inner) => assert!(!inner.is_already_exists()),
            _ => panic!("expected Manager variant"),
        }
    }
}
