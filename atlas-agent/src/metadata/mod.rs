//! Workload metadata records held by the cache and the registries
//!
//! Pod records are immutable once built: an update replaces the record
//! wholesale, and entries still pointing at the previous record keep seeing a
//! consistent (if one event old) view.

mod cache;

pub use cache::{CacheStats, MetadataCache};

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub type Labels = BTreeMap<String, String>;

/// Workload kind treated as ambiguous on fallback lookups
pub const DAEMONSET: &str = "daemonset";

/// The controller a pod ultimately belongs to, e.g. `deployment/api`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workload {
    pub kind: String,
    pub name: String,
}

impl Workload {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() && self.name.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Truncated runtime id; empty for entries built from the pod spec
    pub container_id: String,
    pub name: String,
    /// host port -> container port
    pub host_port_map: HashMap<u32, u32>,
    pub pod: Arc<PodInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    pub uid: String,
    pub ip: String,
    pub name: String,
    pub namespace: String,
    /// Declared container ports; `0` stands for a container without ports
    pub ports: Vec<u32>,
    pub host_ports: Vec<u32>,
    pub container_ids: Vec<String>,
    pub labels: Labels,
    pub workload: Workload,
    pub node_name: String,
    pub node_address: String,
    pub is_host_network: bool,
    pub service: Option<Arc<ServiceInfo>>,
}

impl PodInfo {
    /// Host-network and daemonset pods share addresses with other pods, so
    /// they never answer an ip lookup that did not name their exact port.
    pub fn excluded_from_fallback(&self) -> bool {
        self.is_host_network || self.workload.kind == DAEMONSET
    }
}

#[derive(Debug, Default)]
pub struct ServiceInfo {
    pub ip: String,
    pub name: String,
    pub namespace: String,
    pub selector: Labels,
    pub is_node_port: bool,
    pub ports: Vec<u32>,
    workload: RwLock<Workload>,
}

impl ServiceInfo {
    pub fn new(
        ip: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        selector: Labels,
        is_node_port: bool,
        ports: Vec<u32>,
    ) -> Self {
        Self {
            ip: ip.into(),
            name: name.into(),
            namespace: namespace.into(),
            selector,
            is_node_port,
            ports,
            workload: RwLock::new(Workload::default()),
        }
    }

    /// Workload last seen behind this service
    pub fn workload(&self) -> Workload {
        self.workload.read().clone()
    }

    pub fn annotate(&self, workload: Workload) {
        *self.workload.write() = workload;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub ip: String,
    pub name: String,
    pub labels: Labels,
}

/// Controller of a ReplicaSet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Controller {
    pub name: String,
    pub kind: String,
    pub api_version: String,
}

const ID_SEPARATOR: &str = "://";
const SHORT_ID_LEN: usize = 12;

/// First 12 bytes of the id after `<runtime>://`, or empty when there is no
/// runtime prefix
pub fn truncate_container_id(raw: &str) -> String {
    match raw.split_once(ID_SEPARATOR) {
        Some((_, id)) => id.get(..SHORT_ID_LEN).unwrap_or(id).to_string(),
        None => String::new(),
    }
}

/// Everything after `<runtime>://`, or empty when there is no runtime prefix
pub fn full_container_id(raw: &str) -> String {
    raw.split_once(ID_SEPARATOR)
        .map(|(_, id)| id.to_string())
        .unwrap_or_default()
}

/// Lowercase workload kind, qualified by API group outside the built-in ones
pub fn complete_gvk(api_version: &str, kind: &str) -> String {
    let kind = kind.to_lowercase();
    let group = api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("");
    match group {
        "" | "apps" | "batch" | "extensions" => kind,
        group => format!("{}.{}", kind, group),
    }
}
