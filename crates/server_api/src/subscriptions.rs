//! Per-client view of the store: which keys a client needs, and which of
//! them changed since they were last pushed.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use model_store::{ListenerGuard, ModelStore, StoreError};
use shared::{domain::Key, node::Node, resolve::Values};
use tracing::trace;

pub type ChangeNotifier = Arc<dyn Fn(&str) + Send + Sync>;

/// Store listeners held for one client. Shared with the service so a
/// disconnect can drop them without waiting for the client's session.
#[derive(Debug, Default)]
pub struct ListenerTable {
    guards: Mutex<HashMap<Key, ListenerGuard>>,
    released: AtomicBool,
}

impl ListenerTable {
    fn guards(&self) -> MutexGuard<'_, HashMap<Key, ListenerGuard>> {
        self.guards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops every listener. Later installs are refused.
    pub fn release(&self) {
        let guards = {
            let mut guards = self.guards();
            self.released.store(true, Ordering::SeqCst);
            std::mem::take(&mut *guards)
        };
        drop(guards);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.guards().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.guards().contains_key(key)
    }

    /// Keeps `guard` unless the table was released. The flag is read under
    /// the same lock `release` sets it under.
    fn install(&self, key: Key, guard: ListenerGuard) -> bool {
        let (installed, dropped) = {
            let mut guards = self.guards();
            if self.released.load(Ordering::SeqCst) {
                (false, Some(guard))
            } else {
                (true, guards.insert(key, guard))
            }
        };
        drop(dropped);
        installed
    }

    fn retain(&self, keep: impl Fn(&str) -> bool) {
        let removed: Vec<ListenerGuard> = {
            let mut guards = self.guards();
            let gone: Vec<Key> = guards.keys().filter(|key| !keep(key.as_str())).cloned().collect();
            gone.iter().filter_map(|key| guards.remove(key)).collect()
        };
        drop(removed);
    }
}

pub struct SubscriptionManager {
    store: ModelStore,
    roots: BTreeSet<Key>,
    /// Last loaded value of every key in the closure, as pushed to the client.
    values: Values,
    stale: BTreeSet<Key>,
    forced: BTreeSet<Key>,
    listeners: Arc<ListenerTable>,
    notify: ChangeNotifier,
}

impl SubscriptionManager {
    /// `notify` is called with the key of every store write the client may
    /// care about. It must only enqueue work.
    pub fn new(store: ModelStore, notify: ChangeNotifier) -> Self {
        Self {
            store,
            roots: BTreeSet::new(),
            values: Values::new(),
            stale: BTreeSet::new(),
            forced: BTreeSet::new(),
            listeners: Arc::new(ListenerTable::default()),
            notify,
        }
    }

    pub fn listeners(&self) -> Arc<ListenerTable> {
        self.listeners.clone()
    }

    pub fn roots(&self) -> &BTreeSet<Key> {
        &self.roots
    }

    /// Keys currently reachable from the roots.
    pub fn keys(&self) -> BTreeSet<Key> {
        self.values.keys().cloned().collect()
    }

    /// Adds `root` and returns the values to push. The root itself is always
    /// pushed, even when the client has seen its value before.
    pub async fn activate(&mut self, root: Key) -> Result<Vec<(Key, Node)>, StoreError> {
        self.forced.insert(root.clone());
        self.roots.insert(root);
        self.reconcile().await
    }

    pub async fn deactivate(&mut self, root: &str) -> Result<Vec<(Key, Node)>, StoreError> {
        self.roots.remove(root);
        self.forced.remove(root);
        self.reconcile().await
    }

    pub fn mark_stale(&mut self, key: &str) {
        self.stale.insert(key.to_string());
    }

    /// Reloads stale and missing values, moves listeners to the new closure,
    /// and returns the entries whose value changed.
    ///
    /// On error nothing is modified and the stale marks stay for the next call.
    pub async fn reconcile(&mut self) -> Result<Vec<(Key, Node)>, StoreError> {
        if self.listeners.is_released() {
            return Ok(Vec::new());
        }
        // Roots are listened before loading so a failing root still reports
        // its next write.
        for root in &self.roots {
            self.ensure_listening(root);
        }

        let known: Values = self
            .values
            .iter()
            .filter(|(key, _)| !self.stale.contains(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let closure = self.store.load_closure(&self.roots, known).await?;
        if self.listeners.is_released() {
            return Ok(Vec::new());
        }
        self.stale.clear();

        let mut changes = Vec::new();
        for key in &closure.keys {
            let Some(value) = closure.values.get(key) else {
                continue;
            };
            if self.forced.contains(key) || self.values.get(key) != Some(value) {
                changes.push((key.clone(), value.clone()));
            }
        }

        for key in &closure.keys {
            if !self.ensure_listening(key) {
                continue;
            }
            // Written between our read and the listener install.
            let seen = closure.revisions.get(key).copied();
            if seen.is_some_and(|seen| seen != self.store.revision(key)) {
                (self.notify)(key);
            }
        }
        let roots = &self.roots;
        let keys = &closure.keys;
        self.listeners
            .retain(|key| keys.contains(key) || roots.contains(key));

        trace!(
            keys = closure.keys.len(),
            changes = changes.len(),
            "subscriptions reconciled"
        );
        self.values = closure.values;
        self.forced.clear();
        Ok(changes)
    }

    /// Drops every listener of this client.
    pub fn release(&self) {
        self.listeners.release();
    }

    fn ensure_listening(&self, key: &str) -> bool {
        if self.listeners.contains(key) {
            return false;
        }
        let notify = self.notify.clone();
        let guard = self.store.listen(key, move |key: &str| notify(key));
        self.listeners.install(key.to_string(), guard)
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
