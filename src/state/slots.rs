//! Per-name locked slots.
//!
//! The map lock is only held to find or insert a slot; the value inside each
//! slot has its own mutex, so work on different names never contends.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

type Slot<T> = Arc<Mutex<Option<T>>>;

pub(crate) struct Slots<T> {
    slots: RwLock<HashMap<String, Slot<T>>>,
}

impl<T: Clone> Slots<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Lock the slot for `name`, creating it if needed.
    ///
    /// A slot detached by [`Slots::remove`] while we waited for its lock is
    /// stale; in that case we retry against the current map.
    pub(crate) async fn lock(&self, name: &str) -> OwnedMutexGuard<Option<T>> {
        loop {
            let slot = self.slot(name).await;
            let guard = slot.clone().lock_owned().await;
            let attached = self
                .slots
                .read()
                .await
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, &slot));
            if attached {
                return guard;
            }
        }
    }

    async fn slot(&self, name: &str) -> Slot<T> {
        if let Some(slot) = self.slots.read().await.get(name) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Detach the slot for `name` and return its last value.
    pub(crate) async fn remove(&self, name: &str) -> Option<T> {
        let slot = self.slots.write().await.remove(name)?;
        let mut guard = slot.lock_owned().await;
        guard.take()
    }

    pub(crate) async fn get(&self, name: &str) -> Option<T> {
        let slot = self.slots.read().await.get(name).cloned()?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Copy every populated slot, sorted by name.
    pub(crate) async fn snapshot(&self) -> BTreeMap<String, T> {
        let slots: Vec<(String, Slot<T>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();

        let mut out = BTreeMap::new();
        for (name, slot) in slots {
            if let Some(value) = slot.lock().await.clone() {
                out.insert(name, value);
            }
        }
        out
    }

    /// Seed values without going through per-name locking. Used at load time
    /// before the store is shared.
    pub(crate) async fn seed(&self, values: impl IntoIterator<Item = (String, T)>) {
        let mut slots = self.slots.write().await;
        for (name, value) in values {
            slots.insert(name, Arc::new(Mutex::new(Some(value))));
        }
    }
}
