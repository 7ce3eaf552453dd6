//! Authoritative model entries plus a lazily filled cache of their values.
//!
//! Each key maps to an [`Initializer`]: a literal node or an async producer.
//! Values are computed on first [`ModelStore::get`] and cached until the key is
//! updated or invalidated. Concurrent readers of a key that is still being
//! evaluated share the same in-flight evaluation.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::{
    domain::{Key, ROOT_KEY},
    node::{Component, EventNode, HandlerNode, Node, Reference},
    resolve::{find_references, resolve_key, Values},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("initializer for `{key}` failed: {message}")]
    Evaluation { key: Key, message: String },
    #[error("no model is published under `{key}`")]
    UnresolvedReference { key: Key },
}

pub type Producer = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Node>> + Send + Sync>;

/// Source of a store entry's value.
#[derive(Clone)]
pub enum Initializer {
    Value(Node),
    Producer(Producer),
}

impl Initializer {
    pub fn producer<F, Fut>(produce: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Node>> + Send + 'static,
    {
        Initializer::Producer(Arc::new(move || produce().boxed()))
    }
}

impl fmt::Debug for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initializer::Value(node) => f.debug_tuple("Value").field(node).finish(),
            Initializer::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

impl From<Node> for Initializer {
    fn from(value: Node) -> Self {
        Initializer::Value(value)
    }
}

macro_rules! initializer_from_node {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Initializer {
            fn from(value: $ty) -> Self {
                Initializer::Value(Node::from(value))
            }
        })*
    };
}

initializer_from_node!(
    Component,
    Reference,
    EventNode,
    HandlerNode,
    Vec<Node>,
    &str,
    String,
    bool,
    i32,
    i64,
    f64
);

/// Render-layer validation hook for component props.
pub trait ComponentValidator: Send + Sync {
    fn validate(&self, component: &str, props: &BTreeMap<String, Node>) -> Result<(), String>;
}

/// Values reachable from a set of roots, as loaded by [`ModelStore::load_closure`].
#[derive(Debug, Clone, Default)]
pub struct Closure {
    pub keys: BTreeSet<Key>,
    pub values: Values,
    /// Store revision of every key fetched during this load, read before the fetch.
    pub revisions: HashMap<Key, u64>,
}

type Listener = Arc<dyn Fn(&str) + Send + Sync>;
type Evaluation = Shared<BoxFuture<'static, Result<Node, StoreError>>>;

enum CacheSlot {
    Ready(Node),
    Pending { id: u64, evaluation: Evaluation },
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<Key, Initializer>,
    cache: HashMap<Key, CacheSlot>,
    revisions: HashMap<Key, u64>,
    listeners: HashMap<Key, HashMap<u64, Listener>>,
    next_id: u64,
}

impl StoreState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Drops the cached value, bumps the revision, and returns listeners to notify.
    fn touch(&mut self, key: &str) -> Vec<Listener> {
        self.cache.remove(key);
        *self.revisions.entry(key.to_string()).or_default() += 1;
        self.listeners
            .get(key)
            .map(|listeners| listeners.values().cloned().collect())
            .unwrap_or_default()
    }
}

struct StoreInner {
    state: Mutex<StoreState>,
    validator: Option<Arc<dyn ComponentValidator>>,
}

fn lock(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct ModelStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for ModelStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("ModelStore")
            .field("entries", &state.entries.len())
            .field("cached", &state.cache.len())
            .field("validated", &self.inner.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelStore {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_validator(validator: Arc<dyn ComponentValidator>) -> Self {
        Self::build(Some(validator))
    }

    fn build(validator: Option<Arc<dyn ComponentValidator>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                validator,
            }),
        }
    }

    /// Replaces the entry for `key` and notifies its listeners. The new value
    /// is not computed until someone reads it.
    pub fn update(&self, key: impl Into<Key>, initializer: impl Into<Initializer>) {
        let key = key.into();
        let listeners = {
            let mut state = lock(&self.inner.state);
            state.entries.insert(key.clone(), initializer.into());
            state.touch(&key)
        };
        debug!(%key, listeners = listeners.len(), "model updated");
        notify(&key, listeners);
    }

    pub fn update_root(&self, initializer: impl Into<Initializer>) {
        self.update(ROOT_KEY, initializer);
    }

    /// Drops the cached value of `key` so its producer runs again on next read.
    pub fn invalidate(&self, key: &str) {
        let listeners = lock(&self.inner.state).touch(key);
        debug!(key, listeners = listeners.len(), "model invalidated");
        notify(key, listeners);
    }

    pub fn remove(&self, key: &str) -> bool {
        let (existed, listeners) = {
            let mut state = lock(&self.inner.state);
            let existed = state.entries.remove(key).is_some();
            (existed, state.touch(key))
        };
        if existed {
            debug!(key, "model removed");
        }
        notify(key, listeners);
        existed
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.inner.state).entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = lock(&self.inner.state).entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of writes seen for `key`; changes whenever its value may have changed.
    pub fn revision(&self, key: &str) -> u64 {
        lock(&self.inner.state)
            .revisions
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub async fn get(&self, key: &str) -> Result<Node, StoreError> {
        let (id, evaluation) = {
            let mut guard = lock(&self.inner.state);
            let state = &mut *guard;
            match state.cache.get(key) {
                Some(CacheSlot::Ready(node)) => return Ok(node.clone()),
                Some(CacheSlot::Pending { id, evaluation }) => (*id, evaluation.clone()),
                None => {
                    let initializer = state.entries.get(key).cloned().ok_or_else(|| {
                        StoreError::UnresolvedReference {
                            key: key.to_string(),
                        }
                    })?;
                    match initializer {
                        Initializer::Value(node) => {
                            self.validate(key, &node)?;
                            state
                                .cache
                                .insert(key.to_string(), CacheSlot::Ready(node.clone()));
                            return Ok(node);
                        }
                        Initializer::Producer(produce) => {
                            let id = state.next_id();
                            let evaluation = self.evaluate(key, produce);
                            state.cache.insert(
                                key.to_string(),
                                CacheSlot::Pending {
                                    id,
                                    evaluation: evaluation.clone(),
                                },
                            );
                            debug!(key, "evaluating initializer");
                            (id, evaluation)
                        }
                    }
                }
            }
        };

        let result = evaluation.await;
        self.settle(key, id, &result);
        result
    }

    /// Like [`ModelStore::get`], but unknown keys read as `null`.
    pub async fn get_or_null(&self, key: &str) -> Result<Node, StoreError> {
        match self.get(key).await {
            Err(StoreError::UnresolvedReference { .. }) => Ok(Node::null()),
            other => other,
        }
    }

    /// Value of `key` with every reference substituted.
    pub async fn get_resolved(&self, key: &str) -> Result<Node, StoreError> {
        let roots = BTreeSet::from([key.to_string()]);
        let closure = self.load_closure(&roots, Values::new()).await?;
        Ok(resolve_key(key, &closure.values))
    }

    /// Loads every value reachable from `roots`, reusing `known` values, until
    /// no referenced key is missing.
    pub async fn load_closure(
        &self,
        roots: &BTreeSet<Key>,
        known: Values,
    ) -> Result<Closure, StoreError> {
        let mut values = known;
        let mut revisions = HashMap::new();
        let mut missing: BTreeSet<Key> = roots
            .iter()
            .filter(|key| !values.contains_key(*key))
            .cloned()
            .collect();

        loop {
            for key in std::mem::take(&mut missing) {
                revisions.insert(key.clone(), self.revision(&key));
                let value = self.get_or_null(&key).await?;
                values.insert(key, value);
            }

            let keys = reachable(roots, &values);
            missing = keys
                .iter()
                .filter(|key| !values.contains_key(*key))
                .cloned()
                .collect();
            if missing.is_empty() {
                values.retain(|key, _| keys.contains(key));
                revisions.retain(|key, _| keys.contains(key));
                return Ok(Closure {
                    keys,
                    values,
                    revisions,
                });
            }
        }
    }

    /// Registers `listener` for writes to `key` until the guard is dropped.
    pub fn listen(
        &self,
        key: impl Into<Key>,
        listener: impl Fn(&str) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let key = key.into();
        let mut state = lock(&self.inner.state);
        let id = state.next_id();
        state
            .listeners
            .entry(key.clone())
            .or_default()
            .insert(id, Arc::new(listener));
        ListenerGuard {
            store: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    pub fn listener_count(&self, key: &str) -> usize {
        lock(&self.inner.state)
            .listeners
            .get(key)
            .map_or(0, HashMap::len)
    }

    pub fn total_listeners(&self) -> usize {
        lock(&self.inner.state)
            .listeners
            .values()
            .map(HashMap::len)
            .sum()
    }

    fn evaluate(&self, key: &str, produce: Producer) -> Evaluation {
        let key = key.to_string();
        let validator = self.inner.validator.clone();
        let evaluation: BoxFuture<'static, Result<Node, StoreError>> = async move {
            // A panic settles like an error so the slot is cleared.
            let produced = AssertUnwindSafe(async { produce().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("initializer panicked")));
            let node = produced.map_err(|err| StoreError::Evaluation {
                key: key.clone(),
                message: format!("{err:#}"),
            })?;
            if let Some(validator) = validator {
                validate_tree(validator.as_ref(), &node)
                    .map_err(|message| StoreError::Evaluation { key, message })?;
            }
            Ok(node)
        }
        .boxed();
        evaluation.shared()
    }

    /// Stores the outcome of evaluation `id` if it is still the current one.
    fn settle(&self, key: &str, id: u64, result: &Result<Node, StoreError>) {
        let mut state = lock(&self.inner.state);
        let current = matches!(
            state.cache.get(key),
            Some(CacheSlot::Pending { id: pending, .. }) if *pending == id
        );
        if !current {
            return;
        }
        match result {
            Ok(node) => {
                state
                    .cache
                    .insert(key.to_string(), CacheSlot::Ready(node.clone()));
            }
            Err(error) => {
                state.cache.remove(key);
                warn!(key, %error, "initializer failed; value not cached");
            }
        }
    }

    fn validate(&self, key: &str, node: &Node) -> Result<(), StoreError> {
        match &self.inner.validator {
            Some(validator) => {
                validate_tree(validator.as_ref(), node).map_err(|message| StoreError::Evaluation {
                    key: key.to_string(),
                    message,
                })
            }
            None => Ok(()),
        }
    }
}

/// Roots plus everything their loaded values reference.
pub fn reachable(roots: &BTreeSet<Key>, values: &Values) -> BTreeSet<Key> {
    let mut keys = roots.clone();
    for root in roots {
        if let Some(value) = values.get(root) {
            keys.extend(find_references(value, values));
        }
    }
    keys
}

fn notify(key: &str, listeners: Vec<Listener>) {
    for listener in listeners {
        listener(key);
    }
}

fn validate_tree(validator: &dyn ComponentValidator, node: &Node) -> Result<(), String> {
    match node {
        Node::Component(component) => {
            validator
                .validate(&component.component, &component.props)
                .map_err(|reason| format!("invalid `{}` component: {reason}", component.component))?;
            for prop in component.props.values() {
                validate_tree(validator, prop)?;
            }
            for child in &component.children {
                validate_tree(validator, child)?;
            }
            Ok(())
        }
        Node::List(items) => items.iter().try_for_each(|item| validate_tree(validator, item)),
        Node::Map(map) => map.values().try_for_each(|item| validate_tree(validator, item)),
        _ => Ok(()),
    }
}

/// Keeps a store listener registered; dropping it unregisters the listener.
pub struct ListenerGuard {
    store: Weak<StoreInner>,
    key: Key,
    id: u64,
}

impl ListenerGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let mut state = lock(&inner.state);
        if let Some(listeners) = state.listeners.get_mut(&self.key) {
            listeners.remove(&self.id);
            if listeners.is_empty() {
                state.listeners.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
