use super::Reconcile;
use crate::metadata::NodeInfo;
use crate::store::MetadataStore;
use crate::watch::{NodeObject, ResourceEvent};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

pub struct NodeReconciler {
    store: Arc<MetadataStore>,
}

impl NodeReconciler {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    fn add(&self, node: NodeObject) {
        if node.internal_ip.is_empty() {
            debug!("Node {} reports no InternalIP, not indexed", node.name);
            return;
        }
        debug!("Node {} at {}", node.name, node.internal_ip);
        self.store.nodes.add(NodeInfo {
            ip: node.internal_ip,
            name: node.name,
            labels: node.labels,
        });
    }
}

#[async_trait]
impl Reconcile<NodeObject> for NodeReconciler {
    async fn reconcile(&self, event: ResourceEvent<NodeObject>) {
        match event {
            ResourceEvent::Added(node) => self.add(node),
            ResourceEvent::Updated { old, new } => {
                self.store.nodes.delete_by_name(&old.name);
                self.add(new);
            }
            ResourceEvent::Deleted(node) => self.store.nodes.delete_by_name(&node.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Labels;

    fn node(name: &str, ip: &str) -> NodeObject {
        NodeObject {
            name: name.to_string(),
            resource_version: "1".to_string(),
            internal_ip: ip.to_string(),
            labels: Labels::new(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = Arc::new(MetadataStore::new());
        let reconciler = NodeReconciler::new(Arc::clone(&store));

        reconciler.reconcile(ResourceEvent::Added(node("n1", "10.0.0.1"))).await;
        assert_eq!(store.node_name_by_ip("10.0.0.1").as_deref(), Some("n1"));

        reconciler
            .reconcile(ResourceEvent::Updated {
                old: node("n1", "10.0.0.1"),
                new: node("n1", "10.0.0.2"),
            })
            .await;
        assert!(store.node_name_by_ip("10.0.0.1").is_none());
        assert_eq!(store.node_name_by_ip("10.0.0.2").as_deref(), Some("n1"));

        reconciler.reconcile(ResourceEvent::Deleted(node("n1", ""))).await;
        assert!(store.nodes.is_empty());
    }
}
