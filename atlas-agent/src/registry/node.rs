use crate::metadata::NodeInfo;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Nodes keyed by internal IP
#[derive(Default)]
pub struct NodeRegistry {
    inner: RwLock<HashMap<String, NodeInfo>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: NodeInfo) {
        self.inner.write().insert(node.ip.clone(), node);
    }

    pub fn node_name(&self, ip: &str) -> Option<String> {
        self.inner.read().get(ip).map(|n| n.name.clone())
    }

    /// Remove every entry carrying `name`
    pub fn delete_by_name(&self, name: &str) {
        self.inner.write().retain(|_, n| n.name != name);
    }

    /// Internal IPs of every known node
    pub fn addresses(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
