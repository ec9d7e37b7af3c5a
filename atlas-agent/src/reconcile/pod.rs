use super::Reconcile;
use crate::config::AgentConfig;
use crate::dsf::DsfRuleMap;
use crate::metadata::{
    complete_gvk, full_container_id, truncate_container_id, ContainerInfo, PodInfo, Workload,
};
use crate::registry::DeletedPod;
use crate::runtime::{PortMap, RuntimeService};
use crate::store::MetadataStore;
use crate::watch::{ContainerState, PodObject, ResourceEvent};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const REPLICA_SET: &str = "ReplicaSet";

/// What the pod reconciler needs to publish port-forwarding rules
#[derive(Clone)]
pub struct DsfHooks {
    pub rules: Arc<DsfRuleMap>,
    /// Rules are only created when the runtime can be inspected
    pub runtime: Option<Arc<dyn RuntimeService>>,
}

pub struct PodReconciler {
    store: Arc<MetadataStore>,
    host_ip: String,
    grace_delete_period: Duration,
    track_host_ports: bool,
    dsf: Option<DsfHooks>,
}

impl PodReconciler {
    pub fn new(store: Arc<MetadataStore>, config: &AgentConfig) -> Self {
        Self {
            store,
            host_ip: config.host_ip.clone(),
            grace_delete_period: config.grace_delete_period,
            track_host_ports: config.track_host_ports,
            dsf: None,
        }
    }

    pub fn with_dsf(mut self, hooks: DsfHooks) -> Self {
        self.dsf = Some(hooks);
        self
    }

    async fn add(&self, pod: &PodObject) {
        let workload = self.resolve_workload(pod);

        let services = self.store.services.matching(&pod.namespace, &pod.labels);
        for svc in &services {
            svc.annotate(workload.clone());
        }

        let (ports, host_ports) = pod.declared_ports();
        let info = Arc::new(PodInfo {
            uid: pod.uid.clone(),
            ip: pod.pod_ip.clone(),
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            ports,
            host_ports,
            container_ids: pod.container_ids(),
            labels: pod.labels.clone(),
            workload,
            node_name: pod.node_name.clone(),
            node_address: pod.host_ip.clone(),
            is_host_network: pod.host_network,
            service: services.into_iter().next(),
        });

        let mut port_map: Option<PortMap> = None;
        for status in &pod.statuses {
            let id = truncate_container_id(&status.container_id);
            if id.is_empty() {
                continue;
            }
            let container = Arc::new(ContainerInfo {
                container_id: id.clone(),
                name: status.name.clone(),
                host_port_map: HashMap::new(),
                pod: Arc::clone(&info),
            });
            self.store.cache.add_by_container_id(id, Arc::clone(&container));

            let Some(dsf) = &self.dsf else {
                continue;
            };
            // A failed lookup is retried with the next container.
            if port_map.is_none() && self.is_local_running(pod) {
                if let Some(runtime) = &dsf.runtime {
                    port_map = lookup_ports(runtime.as_ref(), pod, status).await;
                }
            }
            if let Some(map) = port_map.as_ref().filter(|m| !m.is_empty()) {
                if let Some(spec) = pod.containers.iter().find(|c| c.name == status.name) {
                    dsf.rules
                        .create_rules(&container, &spec.container_ports(), map)
                        .await;
                }
            }
        }

        if !pod.pod_ip.is_empty() {
            self.index_addresses(pod, &info);
        }

        debug!(
            "Pod {}/{} at {} ({} {}, {} containers)",
            pod.namespace,
            pod.name,
            pod.pod_ip,
            info.workload.kind,
            info.workload.name,
            info.container_ids.len()
        );
        self.store.pods.add(info);
    }

    fn index_addresses(&self, pod: &PodObject, info: &Arc<PodInfo>) {
        for spec in &pod.containers {
            // A container without declared ports may still listen; keep it
            // findable by IP alone.
            if spec.ports.is_empty() {
                let name = if pod.containers.len() > 1 {
                    String::new()
                } else {
                    spec.name.clone()
                };
                let container = Arc::new(ContainerInfo {
                    container_id: String::new(),
                    name,
                    host_port_map: HashMap::new(),
                    pod: Arc::clone(info),
                });
                self.store
                    .cache
                    .add_container_by_ip_port(&pod.pod_ip, 0, container);
                continue;
            }

            let host_port_map = spec
                .ports
                .iter()
                .filter(|p| p.host_port != 0)
                .map(|p| (p.host_port, p.container_port))
                .collect();
            let container = Arc::new(ContainerInfo {
                container_id: String::new(),
                name: spec.name.clone(),
                host_port_map,
                pod: Arc::clone(info),
            });
            for p in &spec.ports {
                if p.host_port != 0 && self.track_host_ports && !pod.host_ip.is_empty() {
                    self.store.cache.add_container_by_host_ip_port(
                        &pod.host_ip,
                        p.host_port,
                        Arc::clone(&container),
                    );
                }
                self.store.cache.add_container_by_ip_port(
                    &pod.pod_ip,
                    p.container_port,
                    Arc::clone(&container),
                );
            }
        }
    }

    async fn update(&self, old: PodObject, new: PodObject) {
        // Periodic re-lists replay unchanged objects.
        if old.resource_version == new.resource_version {
            return;
        }

        let Some(prior) = self.store.pods.get(&old.namespace, &old.name) else {
            self.add(&new).await;
            return;
        };
        // The new identity is queryable right away; stale parts go later.
        self.add(&new).await;

        let removed_ids = removed(&prior.container_ids, &new.container_ids());
        self.drop_local_rules(&removed_ids).await;

        let (new_ports, new_host_ports) = new.declared_ports();
        let ports = if prior.ip != new.pod_ip {
            prior.ports.clone()
        } else {
            removed(&prior.ports, &new_ports)
        };
        let host_ports = if prior.node_address != new.host_ip {
            prior.host_ports.clone()
        } else {
            removed(&prior.host_ports, &new_host_ports)
        };

        let snapshot = DeletedPod {
            uid: prior.uid.clone(),
            record: Some(Arc::clone(&prior)),
            name: None,
            namespace: prior.namespace.clone(),
            container_ids: removed_ids,
            ip: prior.ip.clone(),
            ports,
            host_ip: prior.node_address.clone(),
            host_ports,
        };
        if !snapshot.is_empty() {
            self.schedule(snapshot);
        }
    }

    async fn delete(&self, pod: PodObject) {
        let container_ids = pod.container_ids();
        self.drop_local_rules(&container_ids).await;

        let (ports, host_ports) = pod.declared_ports();
        let record = self
            .store
            .pods
            .get(&pod.namespace, &pod.name)
            .filter(|p| p.uid == pod.uid);
        debug!("Pod {}/{} deleted", pod.namespace, pod.name);
        self.schedule(DeletedPod {
            uid: pod.uid,
            record,
            name: Some(pod.name),
            namespace: pod.namespace,
            container_ids,
            ip: pod.pod_ip,
            ports,
            host_ip: pod.host_ip,
            host_ports,
        });
    }

    fn schedule(&self, snapshot: DeletedPod) {
        if self.grace_delete_period.is_zero() {
            self.store.remove_pod_snapshot(&snapshot);
        } else {
            self.store.deletions.push(snapshot);
        }
    }

    async fn drop_local_rules(&self, container_ids: &[String]) {
        if let Some(dsf) = &self.dsf {
            for id in container_ids {
                dsf.rules.delete_local_rules_by_container_id(id).await;
            }
        }
    }

    /// Workload of the pod's controller, looking one hop past a ReplicaSet
    fn resolve_workload(&self, pod: &PodObject) -> Workload {
        let Some(owner) = pod.controller() else {
            return Workload::default();
        };
        if owner.kind == REPLICA_SET {
            if let Some(controller) = self.store.replicasets.owner(&pod.namespace, &owner.name) {
                return Workload::new(
                    complete_gvk(&controller.api_version, &controller.kind),
                    controller.name,
                );
            }
        }
        Workload::new(complete_gvk(&owner.api_version, &owner.kind), owner.name.clone())
    }

    /// Only the agent on the pod's node can inspect its containers
    fn is_local_running(&self, pod: &PodObject) -> bool {
        pod.is_running()
            && pod.host_ip == self.host_ip
            && pod
                .host_ip
                .parse::<IpAddr>()
                .is_ok_and(|ip| !ip.is_loopback())
    }
}

async fn lookup_ports(runtime: &dyn RuntimeService, pod: &PodObject, status: &ContainerState) -> Option<PortMap> {
    match runtime
        .port_mapping(&full_container_id(&status.container_id))
        .await
    {
        Ok(map) => Some(map),
        Err(e) => {
            warn!(
                "Failed to get port mapping for container {} of pod {}/{}: {}",
                truncate_container_id(&status.container_id),
                pod.namespace,
                pod.name,
                e
            );
            None
        }
    }
}

/// Elements of `old` missing from `new`, in `old` order, without repeats
fn removed<T: Eq + Hash + Clone>(old: &[T], new: &[T]) -> Vec<T> {
    let new: HashSet<&T> = new.iter().collect();
    let mut seen = HashSet::new();
    old.iter()
        .filter(|v| !new.contains(v) && seen.insert(*v))
        .cloned()
        .collect()
}

#[async_trait]
impl Reconcile<PodObject> for PodReconciler {
    async fn reconcile(&self, event: ResourceEvent<PodObject>) {
        match event {
            ResourceEvent::Added(pod) => self.add(&pod).await,
            ResourceEvent::Updated { old, new } => self.update(old, new).await,
            ResourceEvent::Deleted(pod) => self.delete(pod).await,
        }
    }
}
