//! Deduplicating, rate-limited work queue
//!
//! Keys move through three states: queued, dirty (pending), and processing.
//! An `add` for a key that is already pending is a no-op; an `add` for a key
//! that is currently being processed is recorded and redelivered once
//! [`WorkQueue::done`] is called. A given key is therefore never held by two
//! workers at once, which serializes all reconciles of one object.
//!
//! [`WorkQueue::add_rate_limited`] applies a per-key exponential delay that
//! doubles on every call and resets on [`WorkQueue::forget`]. Workers call it
//! on reconcile failure and `forget` on success, so a persistently failing
//! key backs off toward `max_delay` while a recovered key starts fresh.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// Bounds for the per-key exponential failure backoff
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay applied to a key's first rate-limited add
    pub base_delay: Duration,
    /// Ceiling no per-key delay ever exceeds
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl BackoffConfig {
    /// Delay for the given number of prior rate-limited adds of a key
    pub fn delay_for(&self, requeues: u32) -> Duration {
        // Doubling in f64 space saturates gracefully instead of overflowing.
        let exp = requeues.min(64);
        let delay = self.base_delay.as_secs_f64() * 2f64.powi(exp as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

struct Inner {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    requeues: HashMap<String, u32>,
    shutting_down: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    backoff: BackoffConfig,
}

/// Work queue of object keys with at-most-one-in-flight per key
///
/// Clones share the same queue; handing one to each worker task is cheap.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// Create an empty queue with the given backoff bounds
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    requeues: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Enqueue a key unless it is already pending
    ///
    /// If the key is currently being processed it is only marked dirty and
    /// will be redelivered by [`WorkQueue::done`]. Adds after shutdown are
    /// dropped.
    pub fn add(&self, key: &str) {
        let mut inner = self.lock();
        if inner.shutting_down || inner.dirty.contains(key) {
            return;
        }
        inner.dirty.insert(key.to_string());
        if !inner.processing.contains(key) {
            inner.queue.push_back(key.to_string());
            self.shared.notify.notify_one();
        }
    }

    /// Enqueue a key after its current exponential backoff delay
    ///
    /// Every call grows the key's delay; the first call is near-immediate.
    /// [`WorkQueue::forget`] resets the key to the base delay.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            let requeues = inner.requeues.entry(key.to_string()).or_insert(0);
            let delay = self.shared.backoff.delay_for(*requeues);
            *requeues += 1;
            delay
        };
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "rate-limited enqueue");
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shut down and drained. The returned
    /// key is held in-flight until [`WorkQueue::done`] is called for it.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark processing of a key complete, redelivering any pending duplicate
    pub fn done(&self, key: &str) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.to_string());
            self.shared.notify.notify_one();
        }
    }

    /// Clear a key's backoff state so its next failure starts fresh
    pub fn forget(&self, key: &str) {
        self.lock().requeues.remove(key);
    }

    /// Number of times a key has been rate-limited since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Number of keys currently queued (excluding in-flight keys)
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true when no keys are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new keys and wake all waiters
    ///
    /// Pending and future [`WorkQueue::get`] calls drain what is already
    /// queued, then return `None`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The queue is useless if a holder panicked; propagate the poison.
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
