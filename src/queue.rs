//! Coalescing work queue of node keys.
//!
//! Same contract as the client-go workqueue: a key added while pending is
//! coalesced into the existing entry, a key added while being processed is
//! redelivered once `done` is called, and a key is never processed by two
//! consumers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    order: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    retries: HashMap<String, u32>,
    shutting_down: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `key` unless it is already pending. If `key` is currently
    /// being processed it is only marked dirty and redelivered after `done`.
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutting_down || !inner.dirty.insert(key.to_string()) {
            return;
        }
        if inner.processing.contains(key) {
            return;
        }
        inner.order.push_back(key.to_string());
        drop(inner);
        self.notify.notify_one();
    }

    /// Blocks until a key is available, returning `None` once the queue has
    /// been shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.order.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks processing of `key` complete. If the key went dirty again in the
    /// meantime it is put back on the queue.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.processing.remove(key) && inner.dirty.contains(key) {
            inner.order.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Re-adds a key after a processing failure and returns the attempt
    /// count. Backoff is left to the caller's retry policy.
    pub fn requeue(&self, key: &str) -> u32 {
        let attempts = {
            let mut inner = self.inner.lock().unwrap();
            let attempts = inner.retries.entry(key.to_string()).or_insert(0);
            *attempts += 1;
            *attempts
        };
        self.add(key);
        attempts
    }

    /// Clears retry bookkeeping for `key` after a successful pass.
    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().retries.remove(key);
    }

    /// Stops accepting new keys and unblocks any waiting `get` calls.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutting_down = true;
        self.notify.notify_one();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }
}
