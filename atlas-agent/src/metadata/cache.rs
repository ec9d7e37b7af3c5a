//! Multi-index metadata cache for resolving network addresses to workloads
//!
//! Each index is locked on its own. Operations spanning several indices are
//! not atomic, so a reader may briefly see a container entry that references a
//! pod record one event older than the latest.

use super::{ContainerInfo, PodInfo, ServiceInfo};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// `ip -> port -> value` under a single read-write lock
struct PortIndex<T> {
    inner: RwLock<HashMap<String, HashMap<u32, Arc<T>>>>,
}

impl<T> Default for PortIndex<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> PortIndex<T> {
    fn insert(&self, ip: &str, port: u32, value: Arc<T>) {
        self.inner
            .write()
            .entry(ip.to_string())
            .or_default()
            .insert(port, value);
    }

    fn get(&self, ip: &str, port: u32) -> Option<Arc<T>> {
        self.inner.read().get(ip)?.get(&port).cloned()
    }

    /// Remove one entry when `pred` accepts it, dropping an emptied ip
    fn remove_if(&self, ip: &str, port: u32, pred: impl FnOnce(&T) -> bool) -> Option<Arc<T>> {
        let mut inner = self.inner.write();
        let ports = inner.get_mut(ip)?;
        if !ports.get(&port).is_some_and(|v| pred(v)) {
            return None;
        }
        let removed = ports.remove(&port);
        if ports.is_empty() {
            inner.remove(ip);
        }
        removed
    }

    fn remove(&self, ip: &str, port: u32) -> Option<Arc<T>> {
        self.remove_if(ip, port, |_| true)
    }

    fn len(&self) -> usize {
        self.inner.read().values().map(HashMap::len).sum()
    }

    fn clear(&self) {
        self.inner.write().clear();
    }
}

/// Entry counts per index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub containers: usize,
    pub ip_ports: usize,
    pub host_ip_ports: usize,
    pub services: usize,
}

/// Thread-safe cache indexing containers and services by id and address
#[derive(Default)]
pub struct MetadataCache {
    by_container_id: DashMap<String, Arc<ContainerInfo>>,
    by_ip_port: PortIndex<ContainerInfo>,
    by_host_ip_port: PortIndex<ContainerInfo>,
    services: PortIndex<ServiceInfo>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the container registered under a truncated id
    pub fn add_by_container_id(&self, container_id: impl Into<String>, info: Arc<ContainerInfo>) {
        self.by_container_id.insert(container_id.into(), info);
    }

    pub fn get_by_container_id(&self, container_id: &str) -> Option<Arc<ContainerInfo>> {
        self.by_container_id
            .get(container_id)
            .map(|r| Arc::clone(r.value()))
    }

    pub fn get_pod_by_container_id(&self, container_id: &str) -> Option<Arc<PodInfo>> {
        self.get_by_container_id(container_id)
            .map(|c| Arc::clone(&c.pod))
    }

    pub fn delete_by_container_id(&self, container_id: &str) -> Option<Arc<ContainerInfo>> {
        self.by_container_id.remove(container_id).map(|(_, v)| v)
    }

    /// Remove the entry only while `owned` accepts the pod it points at
    pub fn delete_by_container_id_if_owned(
        &self,
        container_id: &str,
        owned: impl FnOnce(&Arc<PodInfo>) -> bool,
    ) -> bool {
        self.by_container_id
            .remove_if(container_id, |_, c| owned(&c.pod))
            .is_some()
    }

    pub fn add_container_by_ip_port(&self, ip: &str, port: u32, info: Arc<ContainerInfo>) {
        self.by_ip_port.insert(ip, port, info);
    }

    /// Resolve a pod address to a container
    ///
    /// Tries the exact port, then the entry of a container that declared no
    /// port, then any other container on the ip. The last two never answer with
    /// a pod excluded from fallback.
    pub fn get_container_by_ip_port(&self, ip: &str, port: u32) -> Option<Arc<ContainerInfo>> {
        let inner = self.by_ip_port.inner.read();
        let ports = inner.get(ip)?;
        if let Some(info) = ports.get(&port) {
            return Some(Arc::clone(info));
        }
        match ports.get(&0) {
            Some(info) if info.pod.excluded_from_fallback() => None,
            Some(info) => Some(Arc::clone(info)),
            None => first_eligible(ports).cloned(),
        }
    }

    pub fn get_pod_by_ip_port(&self, ip: &str, port: u32) -> Option<Arc<PodInfo>> {
        self.get_container_by_ip_port(ip, port)
            .map(|c| Arc::clone(&c.pod))
    }

    pub fn get_pod_by_ip(&self, ip: &str) -> Option<Arc<PodInfo>> {
        let inner = self.by_ip_port.inner.read();
        first_eligible(inner.get(ip)?).map(|c| Arc::clone(&c.pod))
    }

    pub fn delete_container_by_ip_port(&self, ip: &str, port: u32) -> Option<Arc<ContainerInfo>> {
        self.by_ip_port.remove(ip, port)
    }

    pub fn delete_container_by_ip_port_if_owned(
        &self,
        ip: &str,
        port: u32,
        owned: impl FnOnce(&Arc<PodInfo>) -> bool,
    ) -> bool {
        self.by_ip_port
            .remove_if(ip, port, |c| owned(&c.pod))
            .is_some()
    }

    pub fn add_container_by_host_ip_port(&self, host_ip: &str, host_port: u32, info: Arc<ContainerInfo>) {
        self.by_host_ip_port.insert(host_ip, host_port, info);
    }

    pub fn get_container_by_host_ip_port(&self, host_ip: &str, host_port: u32) -> Option<Arc<ContainerInfo>> {
        self.by_host_ip_port.get(host_ip, host_port)
    }

    pub fn delete_container_by_host_ip_port(&self, host_ip: &str, host_port: u32) -> Option<Arc<ContainerInfo>> {
        self.by_host_ip_port.remove(host_ip, host_port)
    }

    pub fn delete_container_by_host_ip_port_if_owned(
        &self,
        host_ip: &str,
        host_port: u32,
        owned: impl FnOnce(&Arc<PodInfo>) -> bool,
    ) -> bool {
        self.by_host_ip_port
            .remove_if(host_ip, host_port, |c| owned(&c.pod))
            .is_some()
    }

    pub fn add_service_by_ip_port(&self, ip: &str, port: u32, info: Arc<ServiceInfo>) {
        self.services.insert(ip, port, info);
    }

    /// Exact match only
    pub fn get_service_by_ip_port(&self, ip: &str, port: u32) -> Option<Arc<ServiceInfo>> {
        self.services.get(ip, port)
    }

    pub fn delete_service_by_ip_port(&self, ip: &str, port: u32) -> Option<Arc<ServiceInfo>> {
        self.services.remove(ip, port)
    }

    /// Wipe the container-id, ip:port and service indices
    ///
    /// The host ip:port index and the registries are left alone.
    pub fn clear_all(&self) {
        self.by_ip_port.clear();
        self.services.clear();
        self.by_container_id.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            containers: self.by_container_id.len(),
            ip_ports: self.by_ip_port.len(),
            host_ip_ports: self.by_host_ip_port.len(),
            services: self.services.len(),
        }
    }
}

// Iteration order of the port map decides between several eligible entries.
fn first_eligible(ports: &HashMap<u32, Arc<ContainerInfo>>) -> Option<&Arc<ContainerInfo>> {
    ports.values().find(|c| !c.pod.excluded_from_fallback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Labels, Workload, DAEMONSET};

    fn pod(uid: &str, ip: &str, workload_kind: &str, host_network: bool) -> Arc<PodInfo> {
        Arc::new(PodInfo {
            uid: uid.to_string(),
            ip: ip.to_string(),
            name: format!("pod-{}", uid),
            namespace: "default".to_string(),
            workload: Workload::new(workload_kind, "w"),
            is_host_network: host_network,
            ..Default::default()
        })
    }

    fn container(id: &str, pod: &Arc<PodInfo>) -> Arc<ContainerInfo> {
        Arc::new(ContainerInfo {
            container_id: id.to_string(),
            name: id.to_string(),
            host_port_map: HashMap::new(),
            pod: Arc::clone(pod),
        })
    }

    #[test]
    fn test_container_id_insert_get_delete() {
        let cache = MetadataCache::new();
        let p = pod("u1", "10.0.0.5", "deployment", false);
        cache.add_by_container_id("abc", container("abc", &p));

        let found = cache.get_by_container_id("abc").expect("Should find entry");
        assert_eq!(found.pod.uid, "u1");
        assert_eq!(cache.get_pod_by_container_id("abc").unwrap().ip, "10.0.0.5");

        assert!(cache.delete_by_container_id("abc").is_some());
        assert!(cache.get_by_container_id("abc").is_none());
    }

    #[test]
    fn test_container_id_last_writer_wins() {
        let cache = MetadataCache::new();
        let p1 = pod("u1", "10.0.0.5", "", false);
        let p2 = pod("u2", "10.0.0.6", "", false);
        cache.add_by_container_id("abc", container("abc", &p1));
        cache.add_by_container_id("abc", container("abc", &p2));
        assert_eq!(cache.get_by_container_id("abc").unwrap().pod.uid, "u2");
    }

    #[test]
    fn test_ip_port_prefers_exact_then_wildcard() {
        let cache = MetadataCache::new();
        let p = pod("u1", "10.0.0.5", "deployment", false);
        cache.add_container_by_ip_port("10.0.0.5", 80, container("web", &p));
        cache.add_container_by_ip_port("10.0.0.5", 0, container("sidecar", &p));

        assert_eq!(cache.get_container_by_ip_port("10.0.0.5", 80).unwrap().name, "web");
        assert_eq!(cache.get_container_by_ip_port("10.0.0.5", 9999).unwrap().name, "sidecar");
        assert!(cache.get_container_by_ip_port("10.0.0.6", 80).is_none());
    }

    #[test]
    fn test_wildcard_of_excluded_pod_fails() {
        let cache = MetadataCache::new();
        let ds = pod("u1", "10.0.0.1", DAEMONSET, false);
        cache.add_container_by_ip_port("10.0.0.1", 0, container("agent", &ds));
        cache.add_container_by_ip_port("10.0.0.1", 80, container("other", &pod("u2", "10.0.0.1", "", false)));

        assert_eq!(cache.get_container_by_ip_port("10.0.0.1", 80).unwrap().name, "other");
        assert!(cache.get_container_by_ip_port("10.0.0.1", 443).is_none());
    }

    #[test]
    fn test_scan_fallback_skips_excluded_pods() {
        let cache = MetadataCache::new();
        let host = pod("u1", "10.0.0.1", "", true);
        let ds = pod("u2", "10.0.0.1", DAEMONSET, false);
        cache.add_container_by_ip_port("10.0.0.1", 22, container("ssh", &host));
        cache.add_container_by_ip_port("10.0.0.1", 9100, container("exporter", &ds));

        assert!(cache.get_container_by_ip_port("10.0.0.1", 80).is_none());
        assert!(cache.get_pod_by_ip("10.0.0.1").is_none());
        // exact port still resolves
        assert_eq!(cache.get_container_by_ip_port("10.0.0.1", 22).unwrap().name, "ssh");

        let plain = pod("u3", "10.0.0.1", "deployment", false);
        cache.add_container_by_ip_port("10.0.0.1", 8080, container("api", &plain));
        assert_eq!(cache.get_container_by_ip_port("10.0.0.1", 80).unwrap().name, "api");
        assert_eq!(cache.get_pod_by_ip("10.0.0.1").unwrap().uid, "u3");
        assert_eq!(cache.get_pod_by_ip_port("10.0.0.1", 80).unwrap().uid, "u3");
    }

    #[test]
    fn test_delete_ip_port_drops_empty_ip() {
        let cache = MetadataCache::new();
        let p = pod("u1", "10.0.0.5", "", false);
        cache.add_container_by_ip_port("10.0.0.5", 80, container("web", &p));
        assert!(cache.delete_container_by_ip_port("10.0.0.5", 80).is_some());
        assert!(cache.delete_container_by_ip_port("10.0.0.5", 80).is_none());
        assert!(cache.by_ip_port.inner.read().is_empty());
    }

    #[test]
    fn test_owner_guarded_removal() {
        let cache = MetadataCache::new();
        let old = pod("old", "10.0.0.5", "", false);
        let new = pod("new", "10.0.0.5", "", false);
        cache.add_container_by_ip_port("10.0.0.5", 80, container("web", &new));
        cache.add_container_by_host_ip_port("10.0.0.1", 8080, container("web", &new));
        cache.add_by_container_id("abc", container("abc", &new));

        let is_old = |p: &Arc<PodInfo>| Arc::ptr_eq(p, &old);
        assert!(!cache.delete_container_by_ip_port_if_owned("10.0.0.5", 80, is_old));
        assert!(!cache.delete_container_by_host_ip_port_if_owned("10.0.0.1", 8080, is_old));
        assert!(!cache.delete_by_container_id_if_owned("abc", is_old));
        assert_eq!(cache.stats().ip_ports, 1);

        let is_new = |p: &Arc<PodInfo>| Arc::ptr_eq(p, &new);
        assert!(cache.delete_container_by_ip_port_if_owned("10.0.0.5", 80, is_new));
        assert!(cache.delete_container_by_host_ip_port_if_owned("10.0.0.1", 8080, is_new));
        assert!(cache.delete_by_container_id_if_owned("abc", is_new));
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_host_ip_port_is_separate_namespace() {
        let cache = MetadataCache::new();
        let p = pod("u1", "10.0.0.5", "", false);
        cache.add_container_by_host_ip_port("10.0.0.1", 8080, container("web", &p));
        assert!(cache.get_container_by_host_ip_port("10.0.0.1", 8080).is_some());
        assert!(cache.get_container_by_ip_port("10.0.0.1", 8080).is_none());
        assert!(cache.delete_container_by_host_ip_port("10.0.0.1", 8080).is_some());
        assert!(cache.get_container_by_host_ip_port("10.0.0.1", 8080).is_none());
    }

    #[test]
    fn test_service_exact_match_only() {
        let cache = MetadataCache::new();
        let svc = Arc::new(ServiceInfo::new("10.96.0.1", "api", "default", Labels::new(), false, vec![80]));
        cache.add_service_by_ip_port("10.96.0.1", 80, svc);
        assert_eq!(cache.get_service_by_ip_port("10.96.0.1", 80).unwrap().name, "api");
        assert!(cache.get_service_by_ip_port("10.96.0.1", 0).is_none());
        assert!(cache.get_service_by_ip_port("10.96.0.1", 81).is_none());
        cache.delete_service_by_ip_port("10.96.0.1", 80);
        assert!(cache.get_service_by_ip_port("10.96.0.1", 80).is_none());
    }

    #[test]
    fn test_clear_all_keeps_host_ports() {
        let cache = MetadataCache::new();
        let p = pod("u1", "10.0.0.5", "", false);
        cache.add_by_container_id("abc", container("abc", &p));
        cache.add_container_by_ip_port("10.0.0.5", 80, container("web", &p));
        cache.add_container_by_host_ip_port("10.0.0.1", 8080, container("web", &p));
        cache.add_service_by_ip_port(
            "10.96.0.1",
            80,
            Arc::new(ServiceInfo::new("10.96.0.1", "api", "default", Labels::new(), false, vec![80])),
        );

        cache.clear_all();
        assert_eq!(
            cache.stats(),
            CacheStats {
                host_ip_ports: 1,
                ..Default::default()
            }
        );
    }
}
