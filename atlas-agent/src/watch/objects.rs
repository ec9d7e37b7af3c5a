use crate::error::{AgentError, Result};
use crate::metadata::{truncate_container_id, Controller, Labels};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

const POD_RUNNING: &str = "Running";
const NODE_PORT: &str = "NodePort";
const LOAD_BALANCER: &str = "LoadBalancer";
const INTERNAL_IP: &str = "InternalIP";

/// A Kubernetes object narrowed to the fields the agent relies on
pub trait WatchedObject: Clone + Debug + Send + Sync + Sized + 'static {
    type Resource: kube::Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static;

    const KIND: &'static str;

    fn validate(resource: &Self::Resource) -> Result<Self>;

    /// Identity across events, `namespace/name` or `name`
    fn key(&self) -> String;

    fn resource_version(&self) -> &str;
}

fn required<'a>(kind: &'static str, value: &'a Option<String>, field: &str) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AgentError::malformed(kind, format!("missing {}", field))),
    }
}

fn port(kind: &'static str, value: i32, min: i32, field: &str) -> Result<u32> {
    if (min..=65535).contains(&value) {
        Ok(value as u32)
    } else {
        Err(AgentError::malformed(
            kind,
            format!("{} {} out of range", field, value),
        ))
    }
}

fn names(kind: &'static str, meta: &ObjectMeta) -> Result<(String, String)> {
    Ok((
        required(kind, &meta.namespace, "metadata.namespace")?.to_string(),
        required(kind, &meta.name, "metadata.name")?.to_string(),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub container_port: u32,
    /// 0 when no host port is requested
    pub host_port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub ports: Vec<PortSpec>,
}

impl ContainerSpec {
    pub fn container_ports(&self) -> Vec<u32> {
        self.ports.iter().map(|p| p.container_port).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub name: String,
    /// Raw `<runtime>://<id>` form, possibly empty before the container starts
    pub container_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodObject {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    pub labels: Labels,
    pub owners: Vec<OwnerRef>,
    pub node_name: String,
    pub host_network: bool,
    pub containers: Vec<ContainerSpec>,
    pub statuses: Vec<ContainerState>,
    pub phase: String,
    pub pod_ip: String,
    pub host_ip: String,
}

impl PodObject {
    pub fn is_running(&self) -> bool {
        self.phase == POD_RUNNING
    }

    /// Truncated ids of containers that have one
    pub fn container_ids(&self) -> Vec<String> {
        self.statuses
            .iter()
            .map(|s| truncate_container_id(&s.container_id))
            .filter(|id| !id.is_empty())
            .collect()
    }

    /// Declared container ports (`0` for a container without any) and
    /// requested host ports
    pub fn declared_ports(&self) -> (Vec<u32>, Vec<u32>) {
        let mut ports = Vec::new();
        let mut host_ports = Vec::new();
        for container in &self.containers {
            if container.ports.is_empty() {
                ports.push(0);
                continue;
            }
            for p in &container.ports {
                ports.push(p.container_port);
                if p.host_port != 0 {
                    host_ports.push(p.host_port);
                }
            }
        }
        (ports, host_ports)
    }

    pub fn controller(&self) -> Option<&OwnerRef> {
        self.owners.iter().find(|o| o.controller)
    }
}

impl WatchedObject for PodObject {
    type Resource = Pod;
    const KIND: &'static str = "Pod";

    fn validate(pod: &Pod) -> Result<Self> {
        let meta = &pod.metadata;
        let (namespace, name) = names(Self::KIND, meta)?;
        let uid = required(Self::KIND, &meta.uid, "metadata.uid")?.to_string();

        let spec = pod
            .spec
            .as_ref()
            .ok_or_else(|| AgentError::malformed(Self::KIND, "missing spec"))?;

        let mut containers = Vec::with_capacity(spec.containers.len());
        for c in &spec.containers {
            let mut ports = Vec::new();
            for p in c.ports.iter().flatten() {
                ports.push(PortSpec {
                    container_port: port(Self::KIND, p.container_port, 1, "containerPort")?,
                    host_port: port(Self::KIND, p.host_port.unwrap_or(0), 0, "hostPort")?,
                });
            }
            containers.push(ContainerSpec {
                name: c.name.clone(),
                ports,
            });
        }

        let status = pod.status.clone().unwrap_or_default();
        let statuses = status
            .container_statuses
            .iter()
            .flatten()
            .map(|s| ContainerState {
                name: s.name.clone(),
                container_id: s.container_id.clone().unwrap_or_default(),
            })
            .collect();

        let owners = meta
            .owner_references
            .iter()
            .flatten()
            .map(|o| OwnerRef {
                api_version: o.api_version.clone(),
                kind: o.kind.clone(),
                name: o.name.clone(),
                controller: o.controller.unwrap_or(false),
            })
            .collect();

        Ok(Self {
            uid,
            namespace,
            name,
            resource_version: meta.resource_version.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            owners,
            node_name: spec.node_name.clone().unwrap_or_default(),
            host_network: spec.host_network.unwrap_or(false),
            containers,
            statuses,
            phase: status.phase.unwrap_or_default(),
            pod_ip: status.pod_ip.unwrap_or_default(),
            host_ip: status.host_ip.unwrap_or_default(),
        })
    }

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSetObject {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    /// `None` for a bare ReplicaSet
    pub controller: Option<Controller>,
}

impl WatchedObject for ReplicaSetObject {
    type Resource = ReplicaSet;
    const KIND: &'static str = "ReplicaSet";

    fn validate(rs: &ReplicaSet) -> Result<Self> {
        let (namespace, name) = names(Self::KIND, &rs.metadata)?;
        let controller = rs
            .metadata
            .owner_references
            .iter()
            .flatten()
            .find(|o| o.controller.unwrap_or(false))
            .map(|o| Controller {
                name: o.name.clone(),
                kind: o.kind.clone(),
                api_version: o.api_version.clone(),
            });

        Ok(Self {
            namespace,
            name,
            resource_version: rs.metadata.resource_version.clone().unwrap_or_default(),
            controller,
        })
    }

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeObject {
    pub name: String,
    pub resource_version: String,
    /// Empty when the node reports no InternalIP
    pub internal_ip: String,
    pub labels: Labels,
}

impl WatchedObject for NodeObject {
    type Resource = Node;
    const KIND: &'static str = "Node";

    fn validate(node: &Node) -> Result<Self> {
        let name = required(Self::KIND, &node.metadata.name, "metadata.name")?.to_string();
        let internal_ip = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addrs| addrs.iter().rev().find(|a| a.type_ == INTERNAL_IP))
            .map(|a| a.address.clone())
            .unwrap_or_default();

        Ok(Self {
            name,
            resource_version: node.metadata.resource_version.clone().unwrap_or_default(),
            internal_ip,
            labels: node.metadata.labels.clone().unwrap_or_default(),
        })
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePortSpec {
    pub port: u32,
    /// 0 when no node port is allocated
    pub node_port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceObject {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    /// Empty for headless services
    pub cluster_ip: String,
    pub selector: Labels,
    pub is_node_port: bool,
    pub ports: Vec<ServicePortSpec>,
}

impl WatchedObject for ServiceObject {
    type Resource = Service;
    const KIND: &'static str = "Service";

    fn validate(svc: &Service) -> Result<Self> {
        let (namespace, name) = names(Self::KIND, &svc.metadata)?;
        let spec = svc.spec.clone().unwrap_or_default();

        let mut ports = Vec::new();
        for p in spec.ports.iter().flatten() {
            ports.push(ServicePortSpec {
                port: port(Self::KIND, p.port, 1, "port")?,
                node_port: port(Self::KIND, p.node_port.unwrap_or(0), 0, "nodePort")?,
            });
        }

        let cluster_ip = spec
            .cluster_ip
            .filter(|ip| ip != "None")
            .unwrap_or_default();
        let is_node_port = matches!(spec.type_.as_deref(), Some(NODE_PORT) | Some(LOAD_BALANCER));

        Ok(Self {
            namespace,
            name,
            resource_version: svc.metadata.resource_version.clone().unwrap_or_default(),
            cluster_ip,
            selector: spec.selector.unwrap_or_default(),
            is_node_port,
            ports,
        })
    }

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }
}
