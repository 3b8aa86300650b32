//! VirtualMachine Custom Resource Definition
//!
//! A VirtualMachine resource declares the desired name of a remote VM; the
//! controller fills in the status block from the backend. Cached copies are
//! immutable snapshots: every mutation happens on a deep copy that is then
//! written back through the persistence client.

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, VM_PROTECTION_FINALIZER};

/// Specification for a VirtualMachine
///
/// The spec carries only the desired remote name; everything else about the
/// VM is owned by the backend and mirrored into the status block.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machina.dev",
    version = "v1alpha1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    status = "VirtualMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"VM-ID","type":"string","jsonPath":".status.vmId"}"#,
    printcolumn = r#"{"name":"CPU","type":"integer","jsonPath":".status.cpuUtilization"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Desired name of the remote VM; immutable for the life of the resource
    pub vm_name: String,
}

/// Status for a VirtualMachine, mirrored wholesale from the backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Backend identity of the VM; empty until creation has succeeded
    #[serde(default)]
    pub vm_id: String,

    /// Last observed CPU utilization as an integer percentage
    #[serde(default)]
    pub cpu_utilization: i32,
}

impl VirtualMachine {
    /// Returns true if the protection finalizer is attached
    pub fn has_protection_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|token| token == VM_PROTECTION_FINALIZER)
    }

    /// Returns true once deletion of this resource has been requested
    pub fn is_marked_for_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The known backend VM identity, if the status block carries one
    pub fn vm_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|status| status.vm_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Build the `namespace/name` work-queue key for a VirtualMachine
pub fn object_key(vm: &VirtualMachine) -> String {
    match vm.namespace() {
        Some(namespace) => format!("{}/{}", namespace, vm.name_any()),
        None => vm.name_any(),
    }
}

/// Split a work-queue key back into `(namespace, name)`
///
/// A key without a `/` is treated as cluster-scoped (empty namespace). Keys
/// with more than one separator can never resolve and are rejected.
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) => Ok(("", name)),
        (Some(namespace), Some(name), None) => Ok((namespace, name)),
        _ => Err(Error::invalid_key(key)),
    }
}
