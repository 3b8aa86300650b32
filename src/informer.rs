//! Watch-driven desired-state cache and the event adapter
//!
//! A watcher keeps a reflector [`Store`] current; the adapter drains the same
//! event stream and translates every add, update, and delete into a
//! rate-limited enqueue of the affected object's key. Events carry no
//! payload: the reconciler always re-reads the cache, so coalesced or
//! redelivered events are harmless.

use std::pin::pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::VmLister;
use crate::crd::{object_key, VirtualMachine};
use crate::queue::WorkQueue;
use crate::Result;

/// [`VmLister`] backed by a reflector store
pub struct StoreLister {
    store: Store<VirtualMachine>,
}

impl StoreLister {
    /// Wrap a reflector store
    pub fn new(store: Store<VirtualMachine>) -> Self {
        Self { store }
    }
}

impl VmLister for StoreLister {
    fn list(&self) -> Result<Vec<Arc<VirtualMachine>>> {
        Ok(self.store.state())
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<VirtualMachine>>> {
        let mut key = ObjectRef::new(name);
        if !namespace.is_empty() {
            key = key.within(namespace);
        }
        Ok(self.store.get(&key))
    }
}

/// Start watching VirtualMachines and feeding the work queue
///
/// Returns the cache store (hand it to [`StoreLister`]) and the adapter
/// task handle. Callers should wait for the store's initial sync before
/// starting workers, the way the queue would otherwise race the first
/// listing.
pub fn spawn_informer(
    api: Api<VirtualMachine>,
    queue: WorkQueue,
) -> (Store<VirtualMachine>, JoinHandle<()>) {
    let (store, writer) = reflector::store();
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);
    let handle = tokio::spawn(run_event_adapter(stream, queue));
    (store, handle)
}

/// Drain a watch stream, enqueueing the key of every changed object
///
/// Watch errors are logged and swallowed; the watcher itself re-establishes
/// the subscription with backoff.
pub async fn run_event_adapter(
    stream: impl Stream<Item = std::result::Result<watcher::Event<VirtualMachine>, watcher::Error>>,
    queue: WorkQueue,
) {
    let mut stream = pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(vm))
            | Ok(watcher::Event::InitApply(vm))
            | Ok(watcher::Event::Delete(vm)) => {
                let key = object_key(&vm);
                debug!(key = %key, "enqueueing vm from watch event");
                queue.add_rate_limited(&key);
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Err(error) => warn!(%error, "vm watch stream error"),
        }
    }
    info!("vm watch stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VirtualMachineSpec;
    use crate::queue::BackoffConfig;

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

    #[tokio::test(start_paused = true)]
    async fn events_become_rate_limited_enqueues() {
        let queue = WorkQueue::new(BackoffConfig {
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_secs(1),
        });

        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(sample_vm("a"))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Apply(sample_vm("b"))),
            // A coalescible duplicate and a delete for the same object.
            Ok(watcher::Event::Apply(sample_vm("b"))),
            Ok(watcher::Event::Delete(sample_vm("c"))),
        ]);

        run_event_adapter(events, queue.clone()).await;

        let mut keys = Vec::new();
        for _ in 0..3 {
            keys.push(queue.get().await.unwrap());
        }
        keys.sort();
        assert_eq!(keys, vec!["default/a", "default/b", "default/c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_errors_are_survivable() {
        let queue = WorkQueue::new(BackoffConfig::default());
        let events = futures::stream::iter(vec![
            Err(watcher::Error::NoResourceVersion),
            Ok(watcher::Event::Apply(sample_vm("a"))),
        ]);

        run_event_adapter(events, queue.clone()).await;
        assert_eq!(queue.get().await.as_deref(), Some("default/a"));
    }
}
