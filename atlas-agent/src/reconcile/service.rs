use super::Reconcile;
use crate::metadata::ServiceInfo;
use crate::store::MetadataStore;
use crate::watch::{ResourceEvent, ServiceObject};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

pub struct ServiceReconciler {
    store: Arc<MetadataStore>,
}

impl ServiceReconciler {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    fn add(&self, svc: &ServiceObject) {
        let info = Arc::new(ServiceInfo::new(
            svc.cluster_ip.clone(),
            svc.name.clone(),
            svc.namespace.clone(),
            svc.selector.clone(),
            svc.is_node_port,
            svc.ports.iter().map(|p| p.port).collect(),
        ));

        // Pods seen before the service still name its workload.
        if let Some(pod) = self
            .store
            .pods
            .matching_selector(&svc.namespace, &svc.selector)
            .first()
        {
            info.annotate(pod.workload.clone());
        }

        self.store.services.add(Arc::clone(&info));

        if !svc.cluster_ip.is_empty() {
            for p in &svc.ports {
                self.store
                    .cache
                    .add_service_by_ip_port(&svc.cluster_ip, p.port, Arc::clone(&info));
            }
        }
        if svc.is_node_port {
            for node_ip in self.store.nodes.addresses() {
                for p in svc.ports.iter().filter(|p| p.node_port != 0) {
                    self.store
                        .cache
                        .add_service_by_ip_port(&node_ip, p.node_port, Arc::clone(&info));
                }
            }
        }

        debug!(
            "Service {}/{} at {} ({} ports)",
            svc.namespace,
            svc.name,
            svc.cluster_ip,
            svc.ports.len()
        );
    }

    fn delete(&self, svc: &ServiceObject) {
        self.store.services.delete(&svc.namespace, &svc.name);

        if !svc.cluster_ip.is_empty() {
            for p in &svc.ports {
                self.store
                    .cache
                    .delete_service_by_ip_port(&svc.cluster_ip, p.port);
            }
        }
        if svc.is_node_port {
            for node_ip in self.store.nodes.addresses() {
                for p in svc.ports.iter().filter(|p| p.node_port != 0) {
                    self.store
                        .cache
                        .delete_service_by_ip_port(&node_ip, p.node_port);
                }
            }
        }
    }
}

#[async_trait]
impl Reconcile<ServiceObject> for ServiceReconciler {
    async fn reconcile(&self, event: ResourceEvent<ServiceObject>) {
        match event {
            ResourceEvent::Added(svc) => self.add(&svc),
            ResourceEvent::Updated { old, new } => {
                if old.resource_version == new.resource_version {
                    return;
                }
                self.delete(&old);
                self.add(&new);
            }
            ResourceEvent::Deleted(svc) => self.delete(&svc),
        }
    }
}
