use crate::metadata::ContainerInfo;
use crate::runtime::PortMap;
use crate::store::MetadataStore;
use atlas_common::{ContainerNetInfo, Rule, RuleKey, RuleMap, RuleValue};
use log::{debug, info};
use parking_lot::RwLock;
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const QUEUE_CAPACITY: usize = 32;

/// A merged rule together with the container it resolves to on this node
#[derive(Debug, Clone)]
pub struct RuleTarget {
    pub net: ContainerNetInfo,
    /// Known when the container is in this agent's cache; never transmitted
    pub container: Option<Arc<ContainerInfo>>,
}

impl RuleValue for RuleTarget {
    fn net_info(&self) -> &ContainerNetInfo {
        &self.net
    }
}

/// One entry of the single-writer queue
#[derive(Debug)]
pub enum RuleUpdate {
    /// Originates on this node and must reach the config server
    Local(Rule, Option<Arc<ContainerInfo>>),
    /// Learned from the config server
    Remote(Rule),
    /// Withdraw every local rule of a container
    ForgetContainer(String),
    /// Resolves once everything queued before it is applied
    Barrier(oneshot::Sender<()>),
}

/// Receiving end of the queue, consumed by [`DsfRuleMap::run_consumer`]
pub struct RuleQueue {
    rx: mpsc::Receiver<RuleUpdate>,
}

#[derive(Default)]
struct LocalRules {
    rules: RuleMap<RuleTarget>,
    /// Local changes not yet sent to the config server
    pending: Vec<Rule>,
}

/// The cluster-wide view of port-forwarding rules held by one agent
///
/// Only the consumer task writes; every producer goes through the queue, so
/// local changes reach the merged view in the order they were made.
pub struct DsfRuleMap {
    host_ip: String,
    merged: RwLock<RuleMap<RuleTarget>>,
    local: RwLock<LocalRules>,
    tx: mpsc::Sender<RuleUpdate>,
    store: Arc<MetadataStore>,
}

impl DsfRuleMap {
    pub fn new(host_ip: impl Into<String>, store: Arc<MetadataStore>) -> (Arc<Self>, RuleQueue) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let map = Arc::new(Self {
            host_ip: host_ip.into(),
            merged: RwLock::new(RuleMap::new()),
            local: RwLock::new(LocalRules::default()),
            tx,
            store,
        });
        (map, RuleQueue { rx })
    }

    pub fn host_ip(&self) -> &str {
        &self.host_ip
    }

    /// Apply queued updates in order until cancelled
    pub async fn run_consumer(self: Arc<Self>, mut queue: RuleQueue, cancel: CancellationToken) {
        info!("Starting DSF rule consumer for node {}", self.host_ip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = queue.rx.recv() => match update {
                    Some(update) => self.apply(update),
                    None => break,
                },
            }
        }
        info!("DSF rule consumer stopped");
    }

    fn apply(&self, update: RuleUpdate) {
        match update {
            RuleUpdate::Remote(rule) => {
                let container = self.store.get_by_container_id(&rule.container.container_id);
                self.merged.write().accept(
                    &rule.key,
                    RuleTarget {
                        net: rule.container,
                        container,
                    },
                );
            }
            RuleUpdate::Local(rule, container) => self.apply_local(rule, container),
            RuleUpdate::ForgetContainer(container_id) => {
                for port in self.search_local_public_ports_by_container_id(&container_id) {
                    self.apply_local(Rule::deletion(RuleKey::new(&self.host_ip, port)), None);
                }
            }
            RuleUpdate::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    fn apply_local(&self, rule: Rule, container: Option<Arc<ContainerInfo>>) {
        debug!(
            "Local rule {}:{} -> {}:{}{}",
            rule.key.node_ip,
            rule.key.public_port,
            rule.container.container_id,
            rule.container.private_port,
            if rule.container.is_deleted { " (deleted)" } else { "" }
        );
        let target = RuleTarget {
            net: rule.container.clone(),
            container,
        };
        {
            let mut local = self.local.write();
            local.rules.accept(&rule.key, target.clone());
            local.pending.push(rule.clone());
        }
        self.merged.write().accept(&rule.key, target);
    }

    async fn enqueue(&self, update: RuleUpdate) {
        if self.tx.send(update).await.is_err() {
            debug!("DSF rule consumer is gone, dropping update");
        }
    }

    /// Publish one rule per public port bound to each declared private port
    pub async fn create_rules(&self, container: &Arc<ContainerInfo>, declared_ports: &[u32], port_map: &PortMap) {
        for private_port in declared_ports {
            let Some(public_ports) = port_map.get(private_port) else {
                continue;
            };
            for public_port in public_ports {
                let rule = Rule::new(
                    RuleKey::new(&self.host_ip, *public_port),
                    ContainerNetInfo::new(&container.container_id, *private_port),
                );
                self.enqueue(RuleUpdate::Local(rule, Some(Arc::clone(container))))
                    .await;
            }
        }
    }

    /// Withdraw the local rules of a container, resolved when the queue
    /// reaches this request
    pub async fn delete_local_rules_by_container_id(&self, container_id: &str) {
        self.enqueue(RuleUpdate::ForgetContainer(container_id.to_string()))
            .await;
    }

    pub async fn update_local(&self, rules: Vec<Rule>) {
        for rule in rules {
            let container = self.store.get_by_container_id(&rule.container.container_id);
            self.enqueue(RuleUpdate::Local(rule, container)).await;
        }
    }

    pub async fn update_remote(&self, rules: Vec<Rule>) {
        for rule in rules {
            self.enqueue(RuleUpdate::Remote(rule)).await;
        }
    }

    /// Wait until every update queued so far is applied
    pub async fn flushed(&self) {
        let (done, applied) = oneshot::channel();
        self.enqueue(RuleUpdate::Barrier(done)).await;
        let _ = applied.await;
    }

    pub fn search_by_public_port_and_node_ip(&self, public_port: u32, node_ip: &str) -> Option<RuleTarget> {
        self.merged.read().get(node_ip, public_port).cloned()
    }

    /// Any local public port forwarding to `private_port` of the pod at `pod_ip`
    pub fn search_local_public_port_by_pod_ip_and_private_port(&self, private_port: u32, pod_ip: &str) -> Option<u32> {
        self.local
            .read()
            .rules
            .iter()
            .find(|(_, _, target)| {
                target.net.private_port == private_port
                    && target.container.as_ref().is_some_and(|c| c.pod.ip == pod_ip)
            })
            .map(|(_, port, _)| port)
    }

    pub fn search_local_public_ports_by_container_id(&self, container_id: &str) -> Vec<u32> {
        self.local
            .read()
            .rules
            .iter()
            .filter(|(_, _, target)| target.net.container_id == container_id)
            .map(|(_, port, _)| port)
            .collect()
    }

    /// Rules to send next: the full local state, or only what changed since
    /// the last call
    ///
    /// Either way the change log is emptied.
    pub fn drain_outgoing(&self, full_snapshot: bool) -> Vec<Rule> {
        let mut local = self.local.write();
        let pending = std::mem::take(&mut local.pending);
        if full_snapshot {
            local.rules.to_rules()
        } else {
            pending
        }
    }

    pub fn local_snapshot(&self) -> RuleMap {
        RuleMap::from_rules(self.local.read().rules.to_rules())
    }

    pub fn merged_snapshot(&self) -> RuleMap {
        RuleMap::from_rules(self.merged.read().to_rules())
    }

    /// Human readable merged view, one node per block
    pub fn dump(&self) -> String {
        let merged = self.merged.read();
        let mut nodes: Vec<&str> = merged.node_ips().collect();
        nodes.sort_unstable();

        let mut out = String::new();
        for node_ip in nodes {
            let _ = writeln!(out, "[Node]: {}", node_ip);
            let Some(ports) = merged.node(node_ip) else {
                continue;
            };
            let mut ports: Vec<_> = ports.iter().collect();
            ports.sort_unstable_by_key(|(port, _)| **port);
            for (port, target) in ports {
                let _ = writeln!(
                    out,
                    "\t\"{}\" : \"{}:{}\"",
                    port, target.net.container_id, target.net.private_port
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PodInfo;
    use std::collections::HashMap;

    const HOST: &str = "10.0.0.1";

    fn container(id: &str, pod_ip: &str) -> Arc<ContainerInfo> {
        Arc::new(ContainerInfo {
            container_id: id.to_string(),
            name: "app".to_string(),
            host_port_map: HashMap::new(),
            pod: Arc::new(PodInfo {
                uid: format!("uid-{}", id),
                ip: pod_ip.to_string(),
                ..Default::default()
            }),
        })
    }

    fn start() -> (Arc<MetadataStore>, Arc<DsfRuleMap>, CancellationToken) {
        let store = Arc::new(MetadataStore::new());
        let (rules, queue) = DsfRuleMap::new(HOST, Arc::clone(&store));
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&rules).run_consumer(queue, cancel.clone()));
        (store, rules, cancel)
    }

    fn remote(node_ip: &str, public_port: u32, container_id: &str, private_port: u32) -> Rule {
        Rule::new(
            RuleKey::new(node_ip, public_port),
            ContainerNetInfo::new(container_id, private_port),
        )
    }

    #[tokio::test]
    async fn test_create_rules_only_for_bound_ports() {
        let (_store, rules, cancel) = start();
        let c = container("c1", "10.1.0.5");
        let ports = PortMap::from([(80, vec![30080]), (9090, vec![39090])]);
        rules.create_rules(&c, &[80, 443], &ports).await;
        rules.flushed().await;

        assert_eq!(rules.merged_snapshot().len(), 1);
        let target = rules.search_by_public_port_and_node_ip(30080, HOST).unwrap();
        assert_eq!(target.net, ContainerNetInfo::new("c1", 80));
        assert_eq!(target.container.unwrap().pod.ip, "10.1.0.5");
        assert!(rules.search_by_public_port_and_node_ip(39090, HOST).is_none());
        assert_eq!(
            rules.search_local_public_port_by_pod_ip_and_private_port(80, "10.1.0.5"),
            Some(30080)
        );
        assert_eq!(rules.search_local_public_port_by_pod_ip_and_private_port(80, "10.1.0.6"), None);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_local_updates_apply_in_order() {
        let (_store, rules, cancel) = start();
        let key = RuleKey::new(HOST, 30080);
        rules
            .update_local(vec![
                Rule::new(key.clone(), ContainerNetInfo::new("a", 80)),
                Rule::deletion(key.clone()),
                Rule::new(key.clone(), ContainerNetInfo::new("b", 81)),
            ])
            .await;
        rules.flushed().await;

        let target = rules.search_by_public_port_and_node_ip(30080, HOST).unwrap();
        assert_eq!(target.net.container_id, "b");
        assert_eq!(rules.local_snapshot().len(), 1);
        // every step is reported, not just the outcome
        assert_eq!(rules.drain_outgoing(false).len(), 3);
        assert!(rules.drain_outgoing(false).is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_remote_rules_resolve_from_cache() {
        let (store, rules, cancel) = start();
        store
            .cache
            .add_by_container_id("known", container("known", "10.2.0.7"));

        rules
            .update_remote(vec![
                remote("10.0.0.2", 30080, "known", 8080),
                remote("10.0.0.3", 30080, "unknown", 8080),
            ])
            .await;
        rules.flushed().await;

        let known = rules.search_by_public_port_and_node_ip(30080, "10.0.0.2").unwrap();
        assert_eq!(known.container.unwrap().pod.ip, "10.2.0.7");
        let unknown = rules.search_by_public_port_and_node_ip(30080, "10.0.0.3").unwrap();
        assert!(unknown.container.is_none());
        // remote rules never become local
        assert!(rules.local_snapshot().is_empty());
        assert!(rules.drain_outgoing(true).is_empty());

        rules
            .update_remote(vec![Rule::deletion(RuleKey::new("10.0.0.3", 30080))])
            .await;
        rules.flushed().await;
        assert!(rules.search_by_public_port_and_node_ip(30080, "10.0.0.3").is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_forget_container_withdraws_its_rules() {
        let (_store, rules, cancel) = start();
        let ports = PortMap::from([(80, vec![30080, 30081]), (443, vec![30443])]);
        rules.create_rules(&container("c1", "10.1.0.5"), &[80], &ports).await;
        rules.create_rules(&container("c2", "10.1.0.6"), &[443], &ports).await;
        rules.delete_local_rules_by_container_id("c1").await;
        rules.flushed().await;

        assert!(rules.search_local_public_ports_by_container_id("c1").is_empty());
        assert_eq!(rules.search_local_public_ports_by_container_id("c2"), vec![30443]);
        assert_eq!(rules.merged_snapshot().len(), 1);

        let pending = rules.drain_outgoing(false);
        let deletions: Vec<u32> = pending
            .iter()
            .filter(|r| r.container.is_deleted)
            .map(|r| r.key.public_port)
            .collect();
        assert_eq!(deletions.len(), 2);
        assert!(deletions.contains(&30080) && deletions.contains(&30081));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_snapshot_clears_pending() {
        let (_store, rules, cancel) = start();
        let ports = PortMap::from([(80, vec![30080])]);
        rules.create_rules(&container("c1", "10.1.0.5"), &[80], &ports).await;
        rules.flushed().await;

        let snapshot = rules.drain_outgoing(true);
        assert_eq!(snapshot, vec![remote(HOST, 30080, "c1", 80)]);
        assert!(rules.drain_outgoing(false).is_empty());
        assert_eq!(rules.drain_outgoing(true).len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_updates_dropped_after_consumer_stops() {
        let (rules, queue) = DsfRuleMap::new(HOST, Arc::new(MetadataStore::new()));
        drop(queue);
        for port in 0..(QUEUE_CAPACITY as u32 * 2) {
            rules
                .update_remote(vec![remote("10.0.0.2", 30000 + port, "c", 80)])
                .await;
        }
        rules.flushed().await;
        assert!(rules.merged_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_dump_is_sorted() {
        let (_store, rules, cancel) = start();
        rules
            .update_remote(vec![
                remote("10.0.0.3", 30081, "b", 81),
                remote("10.0.0.2", 30080, "a", 80),
                remote("10.0.0.3", 30080, "c", 80),
            ])
            .await;
        rules.flushed().await;
        assert_eq!(
            rules.dump(),
            "[Node]: 10.0.0.2\n\t\"30080\" : \"a:80\"\n[Node]: 10.0.0.3\n\t\"30080\" : \"c:80\"\n\t\"30081\" : \"b:81\"\n"
        );
        cancel.cancel();
    }
}
