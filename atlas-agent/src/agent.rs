//! Task supervision for one node agent

use crate::config::AgentConfig;
use crate::dsf::{ConfigServer, DsfRuleMap, HttpConfigServer, RuleSynchronizer};
use crate::reconcile::{
    DsfHooks, NodeReconciler, PodReconciler, Reconcile, ReplicaSetReconciler, ServiceReconciler,
};
use crate::runtime::{self, RuntimeService};
use crate::store::{self, MetadataStore};
use crate::watch::{NodeObject, PodObject, ReplicaSetObject, ResourceWatcher, ServiceObject, WatchedObject};
use kube::Client;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Upper bound on waiting for a watcher's initial listing before moving on
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// A running agent: shared metadata plus the tasks maintaining it
pub struct Agent {
    config: AgentConfig,
    store: Arc<MetadataStore>,
    dsf: Option<DsfHooks>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Agent {
    /// Start the background tasks described by `config`
    ///
    /// Must be called inside a Tokio runtime. Watchers are started separately
    /// with [`Agent::watch`].
    pub fn new(config: AgentConfig) -> Self {
        let server = config.dsf.as_ref().and_then(|dsf| {
            match HttpConfigServer::new(&dsf.server_addr, &dsf.init_endpoint, &dsf.update_endpoint) {
                Ok(server) => {
                    info!("Syncing DSF rules with {}", server.init_url());
                    Some(Arc::new(server) as Arc<dyn ConfigServer>)
                }
                Err(e) => {
                    warn!("Distributed rules disabled: {}", e);
                    None
                }
            }
        });
        let runtime = server
            .as_ref()
            .and_then(|_| runtime::from_config(&config.runtime));
        Self::with_services(config, server, runtime)
    }

    /// Like [`Agent::new`], with the config server and runtime supplied
    ///
    /// DSF runs only when both `config.dsf` and `server` are set.
    pub fn with_services(
        config: AgentConfig,
        server: Option<Arc<dyn ConfigServer>>,
        runtime: Option<Arc<dyn RuntimeService>>,
    ) -> Self {
        let store = Arc::new(MetadataStore::new());
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        if config.grace_enabled() {
            tracker.spawn(store::run_sweeper(
                Arc::clone(&store),
                config.grace_delete_period,
                config.sweep_interval,
                cancel.clone(),
            ));
        } else {
            info!("Grace delete period is zero, stale entries are removed immediately");
        }

        let dsf = match (&config.dsf, server) {
            (Some(dsf_config), Some(server)) => {
                let (rules, queue) = DsfRuleMap::new(config.host_ip.clone(), Arc::clone(&store));
                tracker.spawn(Arc::clone(&rules).run_consumer(queue, cancel.clone()));

                let sync = RuleSynchronizer::new(Arc::clone(&rules), server).with_debug(dsf_config.debug);
                tracker.spawn(sync.run(dsf_config.sync_interval, cancel.clone()));

                if runtime.is_none() {
                    warn!("No container runtime available, this node publishes no DSF rules");
                }
                Some(DsfHooks { rules, runtime })
            }
            _ => None,
        };

        Self {
            config,
            store,
            dsf,
            tracker,
            cancel,
        }
    }

    /// Start one watcher per kind
    ///
    /// Nodes, ReplicaSets and Services get a bounded head start so pods are
    /// first seen with their owners and services already known.
    pub async fn watch(&self, client: Client) {
        self.spawn_synced(
            ResourceWatcher::<NodeObject>::new(client.clone()),
            NodeReconciler::new(Arc::clone(&self.store)),
        )
        .await;
        self.spawn_synced(
            ResourceWatcher::<ReplicaSetObject>::new(client.clone()),
            ReplicaSetReconciler::new(Arc::clone(&self.store)),
        )
        .await;
        self.spawn_synced(
            ResourceWatcher::<ServiceObject>::new(client.clone()),
            ServiceReconciler::new(Arc::clone(&self.store)),
        )
        .await;

        self.tracker.spawn(ResourceWatcher::<PodObject>::new(client).run(
            self.pod_reconciler(),
            None,
            self.cancel.clone(),
        ));
    }

    async fn spawn_synced<T, R>(&self, watcher: ResourceWatcher<T>, reconciler: R)
    where
        T: WatchedObject,
        R: Reconcile<T> + 'static,
    {
        let (synced, initial_sync) = oneshot::channel();
        self.tracker
            .spawn(watcher.run(reconciler, Some(synced), self.cancel.clone()));

        match tokio::time::timeout(INITIAL_SYNC_TIMEOUT, initial_sync).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("{} watcher stopped before its initial sync", T::KIND),
            Err(_) => warn!(
                "{} initial sync not complete after {:?}, continuing",
                T::KIND,
                INITIAL_SYNC_TIMEOUT
            ),
        }
    }

    /// A pod reconciler wired to this agent's store and DSF rules
    pub fn pod_reconciler(&self) -> PodReconciler {
        let reconciler = PodReconciler::new(Arc::clone(&self.store), &self.config);
        match &self.dsf {
            Some(hooks) => reconciler.with_dsf(hooks.clone()),
            None => reconciler,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn rules(&self) -> Option<&Arc<DsfRuleMap>> {
        self.dsf.as_ref().map(|hooks| &hooks.rules)
    }

    /// Signal every task to stop and wait until they have
    pub async fn shutdown(self) {
        info!("Stopping {} agent tasks...", self.tracker.len());
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("All agent tasks stopped");
    }
}
