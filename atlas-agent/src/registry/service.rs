use super::selector_matches;
use crate::metadata::{Labels, ServiceInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Services keyed by namespace, then name
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<HashMap<String, HashMap<String, Arc<ServiceInfo>>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, service: Arc<ServiceInfo>) {
        self.inner
            .write()
            .entry(service.namespace.clone())
            .or_default()
            .insert(service.name.clone(), service);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<ServiceInfo>> {
        self.inner.read().get(namespace)?.get(name).cloned()
    }

    pub fn delete(&self, namespace: &str, name: &str) -> Option<Arc<ServiceInfo>> {
        let mut inner = self.inner.write();
        let services = inner.get_mut(namespace)?;
        let removed = services.remove(name);
        if services.is_empty() {
            inner.remove(namespace);
        }
        removed
    }

    /// Services in `namespace` whose selector picks a pod carrying `labels`
    ///
    /// Several services may match; callers that need one take the first.
    pub fn matching(&self, namespace: &str, labels: &Labels) -> Vec<Arc<ServiceInfo>> {
        self.inner
            .read()
            .get(namespace)
            .map(|services| {
                services
                    .values()
                    .filter(|s| selector_matches(&s.selector, labels))
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
