//! Controller runtime: worker tasks and the status-sync loop
//!
//! Two independent activities share the [`Context`]: a configurable number
//! of workers each running a dequeue → reconcile → done cycle, and one
//! periodic task that re-polls the status of every known VM regardless of
//! whether any event fired. The queue guarantees no two workers ever hold
//! the same key, so all transitions of one object are serialized; the sync
//! loop's writes for *different* objects race benignly with the workers
//! (last writer wins, each built from a fresh backend read).

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{reconcile, update_vm_status, Context};
use crate::crd::object_key;
use crate::queue::WorkQueue;
use crate::{DEFAULT_STATUS_SYNC_PERIOD, DEFAULT_WORKER_COUNT};

/// Tunables for the controller runtime
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent worker tasks draining the queue
    pub workers: usize,
    /// Period of the status-sync loop
    pub sync_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKER_COUNT,
            sync_period: DEFAULT_STATUS_SYNC_PERIOD,
        }
    }
}

/// The running half of the controller
///
/// Owns the work queue and context and drives them until shutdown.
pub struct VmController {
    ctx: Arc<Context>,
    queue: WorkQueue,
    config: ControllerConfig,
}

impl VmController {
    /// Create a controller over the given context and queue
    pub fn new(ctx: Arc<Context>, queue: WorkQueue, config: ControllerConfig) -> Self {
        Self { ctx, queue, config }
    }

    /// Run workers and the status-sync loop until `shutdown` fires
    ///
    /// Cancellation stops new dequeues and the sync loop between ticks,
    /// lets in-flight reconciles finish, then returns.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            workers = self.config.workers,
            sync_period_ms = self.config.sync_period.as_millis() as u64,
            "starting vm controller"
        );

        let mut tasks = JoinSet::new();
        for worker in 0..self.config.workers {
            let ctx = self.ctx.clone();
            let queue = self.queue.clone();
            tasks.spawn(run_worker(ctx, queue, worker));
        }

        let sync_ctx = self.ctx.clone();
        let sync_shutdown = shutdown.clone();
        let sync_period = self.config.sync_period;
        tasks.spawn(run_status_sync(sync_ctx, sync_period, sync_shutdown));

        shutdown.cancelled().await;
        info!("shutting down vm controller");
        self.queue.shut_down();
        while tasks.join_next().await.is_some() {}
        info!("vm controller stopped");
    }
}

/// One worker: dequeue, reconcile, settle the key, repeat
///
/// A failed reconcile re-enqueues the key with growing backoff; a successful
/// one resets the backoff. Exits when the queue shuts down.
async fn run_worker(ctx: Arc<Context>, queue: WorkQueue, worker: usize) {
    while let Some(key) = queue.get().await {
        match reconcile(&ctx, &key).await {
            Ok(()) => {
                queue.forget(&key);
                debug!(worker, key = %key, "successfully synced");
            }
            Err(error) => {
                warn!(worker, key = %key, %error, "reconcile failed, requeueing with backoff");
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
    debug!(worker, "worker exiting");
}

/// Periodic full status sweep, independent of the event-driven path
async fn run_status_sync(ctx: Arc<Context>, period: Duration, shutdown: CancellationToken) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticks.tick() => sync_all_statuses(&ctx).await,
        }
    }
    debug!("status-sync loop exiting");
}

/// Refresh the status of every VM in the cache, one concurrent query each
///
/// Remote CPU utilization moves without spec edits, so this runs even when
/// no watch event fires. All per-object syncs are issued together and the
/// sweep returns only after the last one finishes. Failures are logged and
/// never abort the sweep; objects whose VM is not created yet simply report
/// a missing identity.
pub async fn sync_all_statuses(ctx: &Context) {
    let vms = match ctx.lister.list() {
        Ok(vms) => vms,
        Err(error) => {
            warn!(%error, "listing vms for status sync failed");
            return;
        }
    };
    if vms.is_empty() {
        return;
    }

    let syncs = vms.iter().map(|vm| update_vm_status(ctx, vm, None));
    for (vm, result) in vms.iter().zip(join_all(syncs).await) {
        if let Err(error) = result {
            debug!(vm = %object_key(vm), %error, "status sync skipped");
        }
    }
}
