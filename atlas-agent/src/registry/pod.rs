use super::selector_matches;
use crate::metadata::{Labels, PodInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Latest record of every pod, keyed by namespace, then name
#[derive(Default)]
pub struct PodRegistry {
    inner: RwLock<HashMap<String, HashMap<String, Arc<PodInfo>>>>,
}

impl PodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pod: Arc<PodInfo>) {
        self.inner
            .write()
            .entry(pod.namespace.clone())
            .or_default()
            .insert(pod.name.clone(), pod);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<PodInfo>> {
        self.inner.read().get(namespace)?.get(name).cloned()
    }

    /// Remove the record only while `owned` accepts it
    pub fn delete_if_owned(
        &self,
        namespace: &str,
        name: &str,
        owned: impl FnOnce(&Arc<PodInfo>) -> bool,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(pods) = inner.get_mut(namespace) else {
            return false;
        };
        if !pods.get(name).is_some_and(owned) {
            return false;
        }
        pods.remove(name);
        if pods.is_empty() {
            inner.remove(namespace);
        }
        true
    }

    /// Pods in `namespace` picked by `selector`; an empty selector picks none
    pub fn matching_selector(&self, namespace: &str, selector: &Labels) -> Vec<Arc<PodInfo>> {
        if selector.is_empty() {
            return Vec::new();
        }
        self.inner
            .read()
            .get(namespace)
            .map(|pods| {
                pods.values()
                    .filter(|p| selector_matches(selector, &p.labels))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
