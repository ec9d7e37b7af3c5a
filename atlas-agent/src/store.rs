//! The agent's metadata, built once at startup and shared by every task

use crate::metadata::{ContainerInfo, MetadataCache, PodInfo, ServiceInfo};
use crate::registry::{
    DeletedPod, DeletionQueue, NodeRegistry, PodRegistry, ReplicaSetRegistry, ServiceRegistry,
};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Cache, registries and deletion queue of one agent
#[derive(Default)]
pub struct MetadataStore {
    pub cache: MetadataCache,
    pub nodes: NodeRegistry,
    pub replicasets: ReplicaSetRegistry,
    pub services: ServiceRegistry,
    pub pods: PodRegistry,
    pub deletions: DeletionQueue,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_container_id(&self, container_id: &str) -> Option<Arc<ContainerInfo>> {
        self.cache.get_by_container_id(container_id)
    }

    pub fn get_container_by_ip_port(&self, ip: &str, port: u32) -> Option<Arc<ContainerInfo>> {
        self.cache.get_container_by_ip_port(ip, port)
    }

    pub fn get_pod_by_ip(&self, ip: &str) -> Option<Arc<PodInfo>> {
        self.cache.get_pod_by_ip(ip)
    }

    pub fn get_container_by_host_ip_port(&self, host_ip: &str, host_port: u32) -> Option<Arc<ContainerInfo>> {
        self.cache.get_container_by_host_ip_port(host_ip, host_port)
    }

    pub fn get_service_by_ip_port(&self, ip: &str, port: u32) -> Option<Arc<ServiceInfo>> {
        self.cache.get_service_by_ip_port(ip, port)
    }

    pub fn node_name_by_ip(&self, ip: &str) -> Option<String> {
        self.nodes.node_name(ip)
    }

    /// Evict exactly what the snapshot recorded, skipping entries that were
    /// rewritten since, by another pod or a later version of this one
    pub fn remove_pod_snapshot(&self, pod: &DeletedPod) {
        let owned = |p: &Arc<PodInfo>| pod.owns(p);
        for id in &pod.container_ids {
            self.cache.delete_by_container_id_if_owned(id, owned);
        }
        if !pod.ip.is_empty() {
            for port in &pod.ports {
                self.cache
                    .delete_container_by_ip_port_if_owned(&pod.ip, *port, owned);
            }
        }
        if !pod.host_ip.is_empty() {
            for port in &pod.host_ports {
                self.cache
                    .delete_container_by_host_ip_port_if_owned(&pod.host_ip, *port, owned);
            }
        }
        if let Some(name) = &pod.name {
            self.pods.delete_if_owned(&pod.namespace, name, owned);
        }
        debug!(
            "Evicted pod {}/{} ({} containers, {} ports, {} host ports)",
            pod.namespace,
            pod.name.as_deref().unwrap_or("-"),
            pod.container_ids.len(),
            pod.ports.len(),
            pod.host_ports.len()
        );
    }

    /// Apply every queued snapshot at least `grace` old; returns how many
    pub fn sweep_expired(&self, grace: Duration) -> usize {
        let expired = self.deletions.drain_expired(grace);
        for pod in &expired {
            self.remove_pod_snapshot(pod);
        }
        expired.len()
    }
}

/// Evict expired snapshots every `interval` until cancelled
pub async fn run_sweeper(
    store: Arc<MetadataStore>,
    grace: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(
        "Starting deletion sweep (grace period {:?}, every {:?})",
        grace, interval
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = store.sweep_expired(grace);
                if evicted > 0 {
                    debug!("Sweep evicted {} pod snapshots, {} pending", evicted, store.deletions.len());
                }
            }
        }
    }

    info!("Deletion sweep stopped");
}
