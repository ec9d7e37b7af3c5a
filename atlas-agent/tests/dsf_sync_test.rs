use async_trait::async_trait;
use atlas_agent::dsf::{ConfigServer, DsfRuleMap, HttpConfigServer, RuleSynchronizer};
use atlas_agent::{AgentError, MetadataStore, Result};
use atlas_common::{endpoints, ContainerNetInfo, Rule, RuleKey, SyncRequest, SyncResponse};
use atlas_server::http::{self, Endpoints};
use atlas_server::RuleCenter;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Talks to a `RuleCenter` in the same process and records payload sizes
struct InProcess {
    center: Arc<RuleCenter>,
    sent: Mutex<Vec<(&'static str, usize)>>,
}

impl InProcess {
    fn new(center: Arc<RuleCenter>) -> Arc<Self> {
        Arc::new(Self {
            center,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(&'static str, usize)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ConfigServer for InProcess {
    async fn init(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.sent.lock().push(("init", request.update_rule.len()));
        self.center
            .init(request)
            .map_err(|e| AgentError::ConfigServer(e.to_string()))
    }

    async fn update(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.sent.lock().push(("update", request.update_rule.len()));
        self.center
            .update(request)
            .map_err(|e| AgentError::ConfigServer(e.to_string()))
    }
}

struct Node {
    rules: Arc<DsfRuleMap>,
    cancel: CancellationToken,
}

impl Node {
    fn start(host_ip: &str) -> Self {
        let (rules, queue) = DsfRuleMap::new(host_ip, Arc::new(MetadataStore::new()));
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&rules).run_consumer(queue, cancel.clone()));
        Self { rules, cancel }
    }

    async fn publish(&self, ports: impl IntoIterator<Item = u32>) {
        let rules = ports
            .into_iter()
            .map(|port| {
                Rule::new(
                    RuleKey::new(self.rules.host_ip(), port),
                    ContainerNetInfo::new(format!("c{}", port), 8080),
                )
            })
            .collect();
        self.rules.update_local(rules).await;
        self.rules.flushed().await;
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn test_init_sends_snapshot_then_only_deltas() {
    let center = Arc::new(RuleCenter::new());
    let server = InProcess::new(Arc::clone(&center));
    let node = Node::start("10.0.0.1");
    let mut sync = RuleSynchronizer::new(Arc::clone(&node.rules), Arc::clone(&server));

    node.publish(30000..30010).await;
    sync.sync_once().await.unwrap();
    assert!(!sync.remote_need_init());
    assert_eq!(center.snapshot().len(), 10);

    node.publish([30010]).await;
    sync.sync_once().await.unwrap();
    sync.sync_once().await.unwrap();

    assert_eq!(server.sent(), vec![("init", 10), ("update", 1), ("update", 0)]);
    assert_eq!(center.snapshot().len(), 11);
    assert!(sync.last_update_timestamp() > 0);
}

#[tokio::test]
async fn test_two_agents_converge() {
    let center = Arc::new(RuleCenter::new());
    let a = Node::start("10.0.0.1");
    let b = Node::start("10.0.0.2");
    let mut sync_a = RuleSynchronizer::new(Arc::clone(&a.rules), InProcess::new(Arc::clone(&center)));
    let mut sync_b = RuleSynchronizer::new(Arc::clone(&b.rules), InProcess::new(Arc::clone(&center)));

    a.publish([30001, 30002]).await;
    b.publish([30001]).await;
    sync_a.sync_once().await.unwrap();
    sync_b.sync_once().await.unwrap();
    sync_a.sync_once().await.unwrap();

    a.rules.flushed().await;
    b.rules.flushed().await;
    let expected = center.snapshot();
    assert_eq!(expected.len(), 3);
    assert_eq!(a.rules.merged_snapshot(), expected);
    assert_eq!(b.rules.merged_snapshot(), expected);

    // a withdrawal travels the same way
    a.rules
        .update_local(vec![Rule::deletion(RuleKey::new("10.0.0.1", 30002))])
        .await;
    a.rules.flushed().await;
    sync_a.sync_once().await.unwrap();
    sync_b.sync_once().await.unwrap();
    b.rules.flushed().await;

    assert!(b.rules.search_by_public_port_and_node_ip(30002, "10.0.0.1").is_none());
    assert_eq!(b.rules.merged_snapshot(), center.snapshot());
    assert_eq!(a.rules.merged_snapshot(), center.snapshot());
}

#[tokio::test]
async fn test_sync_over_http() {
    let center = Arc::new(RuleCenter::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&center);
    tokio::spawn(async move {
        http::serve(listener, serving, &Endpoints::default())
            .await
            .unwrap();
    });

    let client = HttpConfigServer::new(&addr.to_string(), endpoints::INIT, endpoints::UPDATE).unwrap();
    let a = Node::start("10.0.0.1");
    let b = Node::start("10.0.0.2");
    let mut sync_a = RuleSynchronizer::new(Arc::clone(&a.rules), client);

    b.publish([31000]).await;
    let mut sync_b = RuleSynchronizer::new(Arc::clone(&b.rules), InProcess::new(Arc::clone(&center)));
    sync_b.sync_once().await.unwrap();

    a.publish([30080]).await;
    sync_a.sync_once().await.unwrap();
    a.rules.flushed().await;

    assert!(!sync_a.remote_need_init());
    assert!(center.snapshot().get("10.0.0.1", 30080).is_some());
    let remote = a.rules.search_by_public_port_and_node_ip(31000, "10.0.0.2").unwrap();
    assert_eq!(remote.net.container_id, "c31000");
}

#[tokio::test]
async fn test_http_sync_failure_requests_full_resync() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = HttpConfigServer::new(&addr.to_string(), endpoints::INIT, endpoints::UPDATE).unwrap();
    let node = Node::start("10.0.0.1");
    let mut sync = RuleSynchronizer::new(Arc::clone(&node.rules), client);

    node.publish([30080]).await;
    assert!(sync.sync_once().await.is_err());
    assert!(sync.remote_need_init());
    assert_eq!(sync.last_update_timestamp(), 0);
    // local state survives for the next full snapshot
    assert_eq!(node.rules.local_snapshot().len(), 1);
}
