//! Per-service mutual exclusion
//!
//! All provider mutations for a given load balancer are serialized by a
//! per-[`ServiceKey`] lock held across the whole adapter call sequence.
//! Slots are ref-counted: created by the first acquirer, removed when the
//! last holder or waiter releases, so the table stays bounded by the
//! number of services actually being reconciled.

use crate::registry::ServiceKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
}

#[derive(Default)]
pub struct ServiceLockTable {
    slots: Mutex<HashMap<ServiceKey, Slot>>,
}

/// Exclusive ownership of a service key. Released on drop.
pub struct ServiceLockGuard<'a> {
    table: &'a ServiceLockTable,
    key: ServiceKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ServiceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until exclusive ownership of `key` is held. Acquisition
    /// order among waiters is not guaranteed fair.
    pub async fn lock(&self, key: ServiceKey) -> ServiceLockGuard<'_> {
        let mutex = {
            let mut slots = self.slots.lock().expect("lock table poisoned");
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.mutex)
        };

        let guard = mutex.lock_owned().await;
        ServiceLockGuard {
            table: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of live slots; zero when nothing is locked or waiting.
    pub fn live_slots(&self) -> usize {
        self.slots.lock().expect("lock table poisoned").len()
    }

    fn release(&self, key: &ServiceKey) {
        let mut slots = self.slots.lock().expect("lock table poisoned");
        if let Some(slot) = slots.get_mut(key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(key);
            }
        }
    }
}

impl Drop for ServiceLockGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex before decrementing the slot refcount so a
        // waiter can never observe a removed slot it still references.
        self.guard.take();
        self.table.release(&self.key);
    }
}
