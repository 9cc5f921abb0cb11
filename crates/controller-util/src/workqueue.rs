//! Rate-limited, de-duplicating work queue.
//!
//! Keys enqueued while a worker is processing them are coalesced: the key is
//! re-queued once, after the in-flight processing calls `done`. For a given
//! key at most one worker is ever processing it, which is what lets the
//! controllers keep per-key local state without extra locking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::backoff;

pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

struct Inner<T> {
    queue: VecDeque<T>,
    // Keys with a pending (queued or coalesced) add.
    dirty: HashSet<T>,
    // Keys currently held by a worker.
    processing: HashSet<T>,
    requeues: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T: Clone + Eq + Hash + Send + 'static> WorkQueue<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                requeues: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Enqueues a key. A key already pending is left alone; a key being
    /// processed is re-queued when its worker calls `done`.
    pub fn add(&self, item: T) {
        {
            let mut inner = self.lock();
            if inner.shutting_down || !inner.dirty.insert(item.clone()) {
                return;
            }
            if inner.processing.contains(&item) {
                return;
            }
            inner.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue has been shut
    /// down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.clone());
                    return Some(item);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks processing of a key finished, re-queuing it if more work
    /// arrived for it in the meantime.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut inner = self.lock();
            inner.processing.remove(item);
            if inner.dirty.contains(item) && !inner.shutting_down {
                inner.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Re-enqueues a failed key after an exponential delay.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut inner = self.lock();
            let requeues = inner.requeues.entry(item.clone()).or_insert(0);
            let delay = backoff::for_requeues(*requeues);
            *requeues += 1;
            delay
        };
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// How many times the key has been requeued since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().requeues.get(item).copied().unwrap_or(0)
    }

    /// Clears the failure history of a key.
    pub fn forget(&self, item: &T) {
        self.lock().requeues.remove(item);
    }

    /// Stops the queue. Waiting workers drain what is queued, then observe
    /// the shutdown and exit.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
