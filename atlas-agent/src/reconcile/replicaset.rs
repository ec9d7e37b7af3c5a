use super::Reconcile;
use crate::store::MetadataStore;
use crate::watch::{ReplicaSetObject, ResourceEvent};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

pub struct ReplicaSetReconciler {
    store: Arc<MetadataStore>,
}

impl ReplicaSetReconciler {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    fn add(&self, rs: &ReplicaSetObject) {
        if let Some(owner) = &rs.controller {
            debug!(
                "ReplicaSet {}/{} owned by {} {}",
                rs.namespace, rs.name, owner.kind, owner.name
            );
            self.store
                .replicasets
                .put(&rs.namespace, &rs.name, owner.clone());
        }
    }
}

#[async_trait]
impl Reconcile<ReplicaSetObject> for ReplicaSetReconciler {
    async fn reconcile(&self, event: ResourceEvent<ReplicaSetObject>) {
        match event {
            ResourceEvent::Added(rs) => self.add(&rs),
            ResourceEvent::Updated { old, new } => {
                if old.resource_version == new.resource_version {
                    return;
                }
                self.store.replicasets.replace(
                    (&old.namespace, &old.name),
                    new.controller
                        .clone()
                        .map(|owner| (new.namespace.as_str(), new.name.as_str(), owner)),
                );
            }
            ResourceEvent::Deleted(rs) => {
                self.store.replicasets.delete(&rs.namespace, &rs.name);
            }
        }
    }
}
