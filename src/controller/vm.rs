//! VirtualMachine reconciler
//!
//! One invocation per dequeued key. The cycle is a short chain of guarded
//! transitions: resolve the object from the cache, make sure the protection
//! finalizer is attached, run the teardown protocol if deletion was
//! requested, make sure the remote VM exists (creating or adopting it), and
//! finally mirror the backend's status onto the resource.
//!
//! The cache is read-only to every component; each write-back mutates a deep
//! copy. An error anywhere aborts the rest of the cycle and sends the key
//! back to the queue for a backed-off retry.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{object_key, split_key, VirtualMachine, VirtualMachineStatus};
use crate::manager::{VmManager, VmRecord};
use crate::{Error, Result, VM_PROTECTION_FINALIZER};

/// Event reason recorded when a VirtualMachine syncs successfully
pub const SUCCESS_SYNCED: &str = "Synced";

/// Event message recorded when a VirtualMachine syncs successfully
pub const MESSAGE_RESOURCE_SYNCED: &str = "Successfully synced";

/// Read access to the local mirror of desired state
///
/// The store behind this trait is populated by a watch subscription and is
/// eventually consistent; objects it returns are shared snapshots and must
/// never be mutated in place.
#[cfg_attr(test, automock)]
pub trait VmLister: Send + Sync {
    /// All VirtualMachines currently in the cache
    fn list(&self) -> Result<Vec<Arc<VirtualMachine>>>;

    /// Look up one VirtualMachine by namespace and name
    ///
    /// `Ok(None)` means the object is gone, which callers treat as success;
    /// only real lookup failures are errors.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<VirtualMachine>>>;
}

/// Write-back client persisting updated VirtualMachines
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VmWriter: Send + Sync {
    /// Persist the given object as one logical full-object update
    async fn update(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;
}

/// Sink for controller events about a VirtualMachine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Publish an event with the given reason and message
    async fn publish(&self, vm: &VirtualMachine, reason: &str, message: &str);
}

/// Controller context holding the collaborators every reconcile needs
///
/// Shared across all worker tasks and the status-sync loop; everything in it
/// is behind a trait object so tests can swap in mocks.
pub struct Context {
    /// Desired-state cache
    pub lister: Arc<dyn VmLister>,
    /// Persistence write-back client
    pub writer: Arc<dyn VmWriter>,
    /// Remote VM backend
    pub vms: Arc<dyn VmManager>,
    /// Event sink
    pub recorder: Arc<dyn EventRecorder>,
}

impl Context {
    /// Create a new controller context from its collaborators
    pub fn new(
        lister: Arc<dyn VmLister>,
        writer: Arc<dyn VmWriter>,
        vms: Arc<dyn VmManager>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            lister,
            writer,
            vms,
            recorder,
        }
    }
}

/// Production [`VmWriter`] backed by the Kubernetes API
///
/// The update contract is one logical full-object write. With the status
/// subresource enabled on the CRD that takes a metadata/spec merge patch
/// plus a status patch, both behind this single seam.
pub struct VmWriterImpl {
    client: Client,
}

impl VmWriterImpl {
    /// Create a new writer using the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VmWriter for VmWriterImpl {
    async fn update(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let namespace = vm.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), &namespace);
        let name = vm.name_any();
        let params = PatchParams::default();

        let mut updated = api.patch(&name, &params, &Patch::Merge(vm)).await?;
        if let Some(status) = &vm.status {
            updated = api
                .patch_status(
                    &name,
                    &params,
                    &Patch::Merge(&serde_json::json!({ "status": status })),
                )
                .await?;
        }
        Ok(updated)
    }
}

/// [`EventRecorder`] that writes events to the log
///
/// Event/audit recording against the system of record is an external
/// concern; this default keeps the notification visible without one.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogRecorder;

#[async_trait]
impl EventRecorder for LogRecorder {
    async fn publish(&self, vm: &VirtualMachine, reason: &str, message: &str) {
        info!(vm = %object_key(vm), reason, message, "recorded event");
    }
}

/// Reconcile the VirtualMachine behind one work-queue key
///
/// Returns `Ok(())` both on a full sync and on the benign terminal cases
/// (object vanished, malformed key). Any error leaves the remaining stages
/// unexecuted for this cycle and is retried by the caller.
#[instrument(skip_all, fields(key = %key))]
pub async fn reconcile(ctx: &Context, key: &str) -> Result<()> {
    let (namespace, name) = match split_key(key) {
        Ok(parts) => parts,
        Err(error) => {
            // A key that cannot be parsed can never succeed; drop it for good.
            warn!(%error, "dropping malformed work item");
            return Ok(());
        }
    };

    let vm = match ctx.lister.get(namespace, name)? {
        Some(vm) => vm,
        None => {
            debug!("vm no longer exists, nothing to reconcile");
            return Ok(());
        }
    };

    if !vm.has_protection_finalizer() {
        // The write-back fires an update event; the next cycle re-enters
        // from a fresh cache read with the finalizer in place.
        return add_finalizer(ctx, &vm).await;
    }

    if vm.is_marked_for_deletion() {
        return teardown(ctx, &vm).await;
    }

    let created = match vm.vm_id() {
        None => Some(ensure_vm(ctx, &vm).await?),
        Some(_) => None,
    };

    update_vm_status(ctx, &vm, created.as_ref()).await?;

    ctx.recorder
        .publish(&vm, SUCCESS_SYNCED, MESSAGE_RESOURCE_SYNCED)
        .await;
    Ok(())
}

/// Make the remote VM exist, creating it or adopting a same-named survivor
///
/// "Already exists" is not a failure: a prior partial run may have created
/// the VM without ever writing its identity back. Listing and matching by
/// name recovers that identity.
async fn ensure_vm(ctx: &Context, vm: &VirtualMachine) -> Result<VmRecord> {
    let name = &vm.spec.vm_name;
    match ctx.vms.create(name).await {
        Ok(instance) => {
            info!(vm = %object_key(vm), id = %instance.id, "created remote vm");
            Ok(instance)
        }
        Err(error) if error.is_already_exists() => {
            debug!(vm = %object_key(vm), "remote vm already exists, adopting");
            find_vm_by_name(ctx, name).await
        }
        Err(error) => Err(error.into()),
    }
}

async fn find_vm_by_name(ctx: &Context, name: &str) -> Result<VmRecord> {
    let instances = ctx.vms.list().await?;
    instances
        .into_iter()
        .find(|instance| instance.name == name)
        .ok_or_else(|| Error::vm_not_in_list(name))
}

/// Finalizer-guarded teardown of the remote VM
///
/// The finalizer comes off only after the backend confirms the VM is gone
/// (deleted now, or already absent). A failed lookup or delete keeps the
/// finalizer, so the resource cannot vanish while the VM leaks.
async fn teardown(ctx: &Context, vm: &VirtualMachine) -> Result<()> {
    let name = &vm.spec.vm_name;
    let instances = ctx.vms.list().await?;
    match instances.into_iter().find(|instance| instance.name == *name) {
        Some(instance) => match ctx.vms.delete(&instance.id).await {
            Ok(()) => info!(vm = %object_key(vm), id = %instance.id, "deleted remote vm"),
            Err(error) if error.is_not_found() => {
                debug!(vm = %object_key(vm), "remote vm vanished before delete")
            }
            Err(error) => return Err(error.into()),
        },
        None => debug!(vm = %object_key(vm), "remote vm already absent, nothing to tear down"),
    }
    remove_finalizer(ctx, vm).await
}

/// Mirror the backend's live status onto the resource
///
/// The identity to query is the object's known `status.vmId` when set,
/// otherwise the record just created or adopted this cycle. The write-back
/// is skipped when the fresh status equals what the object already carries,
/// so repeat reconciles with no state change stay write-free.
pub(crate) async fn update_vm_status(
    ctx: &Context,
    vm: &VirtualMachine,
    created: Option<&VmRecord>,
) -> Result<()> {
    let key = object_key(vm);
    let vm_id = match vm.vm_id() {
        Some(id) => id.to_string(),
        None => match created {
            Some(instance) if !instance.id.is_empty() => instance.id.clone(),
            _ => return Err(Error::missing_vm_id(key)),
        },
    };

    let status = ctx.vms.get_status(&vm_id).await?;
    let next = VirtualMachineStatus {
        vm_id: status.vm_id,
        cpu_utilization: status.cpu_utilization,
    };
    if vm.status.as_ref() == Some(&next) {
        debug!(vm = %key, "status unchanged, skipping write-back");
        return Ok(());
    }

    // The cache owns `vm`; only a deep copy may be mutated.
    let mut copy = vm.clone();
    copy.status = Some(next);
    ctx.writer.update(&copy).await?;
    debug!(vm = %key, "updated vm status");
    Ok(())
}

async fn add_finalizer(ctx: &Context, vm: &VirtualMachine) -> Result<()> {
    let mut copy = vm.clone();
    copy.metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(VM_PROTECTION_FINALIZER.to_string());
    ctx.writer.update(&copy).await?;
    debug!(vm = %object_key(vm), "added protection finalizer");
    Ok(())
}

async fn remove_finalizer(ctx: &Context, vm: &VirtualMachine) -> Result<()> {
    let mut copy = vm.clone();
    if let Some(finalizers) = copy.metadata.finalizers.as_mut() {
        finalizers.retain(|token| token != VM_PROTECTION_FINALIZER);
    }
    ctx.writer.update(&copy).await?;
    debug!(vm = %object_key(vm), "removed protection finalizer");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ManagerError, MockVmManager, VmStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::Sequence;

    use crate::crd::VirtualMachineSpec;

    // ===== Fixtures =====

    fn sample_vm(name: &str) -> VirtualMachine {
        let mut vm = VirtualMachine::new(
            name,
            VirtualMachineSpec {
                vm_name: name.to_string(),
            },
        );
        vm.metadata.namespace = Some("default".to_string());
        vm
    }

    fn vm_with_finalizer(name: &str) -> VirtualMachine {
        let mut vm = sample_vm(name);
        vm.metadata.finalizers = Some(vec![VM_PROTECTION_FINALIZER.to_string()]);
        vm
    }

    fn vm_with_id(name: &str, id: &str, cpu: i32) -> VirtualMachine {
        let mut vm = vm_with_finalizer(name);
        vm.status = Some(VirtualMachineStatus {
            vm_id: id.to_string(),
            cpu_utilization: cpu,
        });
        vm
    }

    fn deleting_vm(name: &str) -> VirtualMachine {
        let mut vm = vm_with_finalizer(name);
        vm.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        vm
    }

    fn lister_returning(vm: VirtualMachine) -> MockVmLister {
        let vm = Arc::new(vm);
        let mut lister = MockVmLister::new();
        lister
            .expect_get()
            .returning(move |_, _| Ok(Some(vm.clone())));
        lister
    }

    fn echo_writer(times: usize) -> MockVmWriter {
        let mut writer = MockVmWriter::new();
        writer
            .expect_update()
            .times(times)
            .returning(|vm| Ok(vm.clone()));
        writer
    }

    fn recorder_expecting(times: usize) -> MockEventRecorder {
        let mut recorder = MockEventRecorder::new();
        recorder
            .expect_publish()
            .times(times)
            .returning(|_, _, _| ());
        recorder
    }

    fn context(
        lister: MockVmLister,
        writer: MockVmWriter,
        vms: MockVmManager,
        recorder: MockEventRecorder,
    ) -> Context {
        Context::new(
            Arc::new(lister),
            Arc::new(writer),
            Arc::new(vms),
            Arc::new(recorder),
        )
    }

    // ===== Resolve stage =====

    #[tokio::test]
    async fn vanished_object_is_not_an_error() {
        let mut lister = MockVmLister::new();
        lister.expect_get().returning(|_, _| Ok(None));
        let ctx = context(
            lister,
            MockVmWriter::new(),
            MockVmManager::new(),
            MockEventRecorder::new(),
        );

        assert!(reconcile(&ctx, "default/gone").await.is_ok());
    }

    #[tokio::test]
    async fn malformed_key_is_dropped_without_retry() {
        let ctx = context(
            MockVmLister::new(),
            MockVmWriter::new(),
            MockVmManager::new(),
            MockEventRecorder::new(),
        );

        // No collaborator is touched and no error is surfaced, so the worker
        // forgets the key instead of retrying it forever.
        assert!(reconcile(&ctx, "too/many/segments").await.is_ok());
    }

    #[tokio::test]
    async fn lookup_failure_propagates_for_retry() {
        let mut lister = MockVmLister::new();
        lister.expect_get().returning(|_, _| {
            Err(Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "etcd timeout".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            })))
        });
        let ctx = context(
            lister,
            MockVmWriter::new(),
            MockVmManager::new(),
            MockEventRecorder::new(),
        );

        assert!(reconcile(&ctx, "default/test").await.is_err());
    }

    // ===== Finalizer stage =====

    /// A fresh object gets exactly one write-back that attaches the
    /// protection finalizer; creation and status wait for the next cycle.
    #[tokio::test]
    async fn first_cycle_only_attaches_finalizer() {
        let lister = lister_returning(sample_vm("test"));
        let mut writer = MockVmWriter::new();
        writer
            .expect_update()
            .times(1)
            .withf(|vm| vm.has_protection_finalizer() && vm.status.is_none())
            .returning(|vm| Ok(vm.clone()));
        let ctx = context(
            lister,
            writer,
            MockVmManager::new(),
            MockEventRecorder::new(),
        );

        assert!(reconcile(&ctx, "default/test").await.is_ok());
    }

    // ===== Creation and adoption =====

    #[tokio::test]
    async fn creation_cycle_writes_back_the_new_identity() {
        let lister = lister_returning(vm_with_finalizer("test"));
        let mut vms = MockVmManager::new();
        vms.expect_create().times(1).returning(|name| {
            Ok(VmRecord {
                id: "vm-1".to_string(),
                name: name.to_string(),
            })
        });
        vms.expect_get_status().times(1).returning(|id| {
            Ok(VmStatus {
                vm_id: id.to_string(),
                cpu_utilization: 37,
            })
        });
        let mut writer = MockVmWriter::new();
        writer
            .expect_update()
            .times(1)
            .withf(|vm| {
                let status = vm.status.as_ref().unwrap();
                status.vm_id == "vm-1" && status.cpu_utilization == 37
            })
            .returning(|vm| Ok(vm.clone()));
        let ctx = context(lister, writer, vms, recorder_expecting(1));

        assert!(reconcile(&ctx, "default/test").await.is_ok());
    }

    /// "Already exists" resolves to the identity List reports for the same
    /// name instead of failing the cycle.
    #[tokio::test]
    async fn adoption_resolves_to_the_listed_identity() {
        let lister = lister_returning(vm_with_finalizer("test"));
        let mut vms = MockVmManager::new();
        vms.expect_create()
            .times(1)
            .returning(|name| Err(ManagerError::AlreadyExists(name.to_string())));
        vms.expect_list().times(1).returning(|| {
            Ok(vec![
                VmRecord {
                    id: "vm-8".to_string(),
                    name: "other".to_string(),
                },
                VmRecord {
                    id: "vm-9".to_string(),
                    name: "test".to_string(),
                },
            ])
        });
        vms.expect_get_status()
            .times(1)
            .withf(|id| id == "vm-9")
            .returning(|id| {
                Ok(VmStatus {
                    vm_id: id.to_string(),
                    cpu_utilization: 5,
                })
            });
        let ctx = context(lister, echo_writer(1), vms, recorder_expecting(1));

        assert!(reconcile(&ctx, "default/test").await.is_ok());
    }

    #[tokio::test]
    async fn adoption_miss_fails_the_cycle() {
        let lister = lister_returning(vm_with_finalizer("test"));
        let mut vms = MockVmManager::new();
        vms.expect_create()
            .returning(|name| Err(ManagerError::AlreadyExists(name.to_string())));
        vms.expect_list().returning(|| Ok(Vec::new()));
        let ctx = context(
            lister,
            MockVmWriter::new(),
            vms,
            MockEventRecorder::new(),
        );

        let err = reconcile(&ctx, "default/test").await.unwrap_err();
        assert!(matches!(err, Error::VmNotInList(name) if name == "test"));
    }

    /// A backend that "creates" a VM without an identity leaves status sync
    /// with nothing to query; that is an invariant violation, not a success.
    #[tokio::test]
    async fn created_record_without_identity_is_a_hard_error() {
        let lister = lister_returning(vm_with_finalizer("test"));
        let mut vms = MockVmManager::new();
        vms.expect_create().returning(|name| {
            Ok(VmRecord {
                id: String::new(),
                name: name.to_string(),
            })
        });
        vms.expect_get_status().times(0);
        let ctx = context(
            lister,
            MockVmWriter::new(),
            vms,
            MockEventRecorder::new(),
        );

        let err = reconcile(&ctx, "default/test").await.unwrap_err();
        assert!(matches!(err, Error::MissingVmId(_)));
    }

    // ===== Status sync =====

    #[tokio::test]
    async fn known_identity_is_preferred_for_status_queries() {
        let lister = lister_returning(vm_with_id("test", "vm-1", 10));
        let mut vms = MockVmManager::new();
        vms.expect_create().times(0);
        vms.expect_get_status()
            .times(1)
            .withf(|id| id == "vm-1")
            .returning(|id| {
                Ok(VmStatus {
                    vm_id: id.to_string(),
                    cpu_utilization: 55,
                })
            });
        let ctx = context(lister, echo_writer(1), vms, recorder_expecting(1));

        assert!(reconcile(&ctx, "default/test").await.is_ok());
    }

    /// Reconciling again with no intervening state change produces zero
    /// additional write-backs.
    #[tokio::test]
    async fn repeat_reconcile_with_unchanged_status_writes_nothing() {
        let lister = lister_returning(vm_with_id("test", "vm-1", 10));
        let mut vms = MockVmManager::new();
        vms.expect_get_status().times(2).returning(|id| {
            Ok(VmStatus {
                vm_id: id.to_string(),
                cpu_utilization: 10,
            })
        });
        let mut writer = MockVmWriter::new();
        writer.expect_update().times(0);
        let ctx = context(lister, writer, vms, recorder_expecting(2));

        assert!(reconcile(&ctx, "default/test").await.is_ok());
        assert!(reconcile(&ctx, "default/test").await.is_ok());
    }

    // ===== Deletion protocol =====

    #[tokio::test]
    async fn teardown_deletes_remote_vm_before_releasing_finalizer() {
        let lister = lister_returning(deleting_vm("test"));
        let mut order = Sequence::new();
        let mut vms = MockVmManager::new();
        vms.expect_list().times(1).returning(|| {
            Ok(vec![VmRecord {
                id: "vm-1".to_string(),
                name: "test".to_string(),
            }])
        });
        vms.expect_delete()
            .times(1)
            .withf(|id| id == "vm-1")
            .in_sequence(&mut order)
            .returning(|_| Ok(()));
        let mut writer = MockVmWriter::new();
        writer
            .expect_update()
            .times(1)
            .withf(|vm| !vm.has_protection_finalizer())
            .in_sequence(&mut order)
            .returning(|vm| Ok(vm.clone()));
        let ctx = context(lister, writer, vms, MockEventRecorder::new());

        assert!(reconcile(&ctx, "default/test").await.is_ok());
    }

    /// No remote VM with the desired name means there is nothing to tear
    /// down: the finalizer comes off with zero Delete calls.
    #[tokio::test]
    async fn teardown_of_absent_remote_vm_is_already_clean() {
        let lister = lister_returning(deleting_vm("test"));
        let mut vms = MockVmManager::new();
        vms.expect_list().times(1).returning(|| Ok(Vec::new()));
        vms.expect_delete().times(0);
        let mut writer = MockVmWriter::new();
        writer
            .expect_update()
            .times(1)
            .withf(|vm| !vm.has_protection_finalizer())
            .returning(|vm| Ok(vm.clone()));
        let ctx = context(lister, writer, vms, MockEventRecorder::new());

        assert!(reconcile(&ctx, "default/test").await.is_ok());
    }

    #[tokio::test]
    async fn failed_delete_keeps_the_finalizer() {
        let lister = lister_returning(deleting_vm("test"));
        let mut vms = MockVmManager::new();
        vms.expect_list().returning(|| {
            Ok(vec![VmRecord {
                id: "vm-1".to_string(),
                name: "test".to_string(),
            }])
        });
        vms.expect_delete()
            .returning(|_| Err(ManagerError::backend("hypervisor unreachable")));
        let mut writer = MockVmWriter::new();
        writer.expect_update().times(0);
        let ctx = context(lister, writer, vms, MockEventRecorder::new());

        assert!(reconcile(&ctx, "default/test").await.is_err());
    }

    #[tokio::test]
    async fn failed_listing_during_teardown_keeps_the_finalizer() {
        let lister = lister_returning(deleting_vm("test"));
        let mut vms = MockVmManager::new();
        vms.expect_list()
            .returning(|| Err(ManagerError::backend("hypervisor unreachable")));
        let mut writer = MockVmWriter::new();
        writer.expect_update().times(0);
        let ctx = context(lister, writer, vms, MockEventRecorder::new());

        assert!(reconcile(&ctx, "default/test").await.is_err());
    }

    /// The VM disappearing between List and Delete is the same as it never
    /// having been there.
    #[tokio::test]
    async fn delete_race_with_backend_cleanup_is_clean() {
        let lister = lister_returning(deleting_vm("test"));
        let mut vms = MockVmManager::new();
        vms.expect_list().returning(|| {
            Ok(vec![VmRecord {
                id: "vm-1".to_string(),
                name: "test".to_string(),
            }])
        });
        vms.expect_delete()
            .returning(|id| Err(ManagerError::NotFound(id.to_string())));
        let mut writer = MockVmWriter::new();
        writer
            .expect_update()
            .times(1)
            .withf(|vm| !vm.has_protection_finalizer())
            .returning(|vm| Ok(vm.clone()));
        let ctx = context(lister, writer, vms, MockEventRecorder::new());

        assert!(reconcile(&ctx, "default/test").await.is_ok());
    }
}
