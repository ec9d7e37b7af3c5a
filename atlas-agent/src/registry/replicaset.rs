use crate::metadata::Controller;
use parking_lot::RwLock;
use std::collections::HashMap;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Controller of every ReplicaSet, keyed by (namespace, name)
#[derive(Default)]
pub struct ReplicaSetRegistry {
    inner: RwLock<HashMap<Key, Controller>>,
}

impl ReplicaSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, namespace: &str, name: &str, owner: Controller) {
        self.inner.write().insert(key(namespace, name), owner);
    }

    pub fn owner(&self, namespace: &str, name: &str) -> Option<Controller> {
        self.inner.read().get(&key(namespace, name)).cloned()
    }

    pub fn delete(&self, namespace: &str, name: &str) -> Option<Controller> {
        self.inner.write().remove(&key(namespace, name))
    }

    /// Delete the old entry and add the new one under a single write guard
    ///
    /// Readers see either the old or the new owner, never neither.
    pub fn replace(&self, old: (&str, &str), new: Option<(&str, &str, Controller)>) {
        let mut inner = self.inner.write();
        inner.remove(&key(old.0, old.1));
        if let Some((namespace, name, owner)) = new {
            inner.insert(key(namespace, name), owner);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
