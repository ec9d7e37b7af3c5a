//! Translate watch events into registry and cache mutations
//!
//! One reconciler per resource kind, each driven by a single watch task, so
//! changes to one kind apply in order. Kinds are not ordered relative to each
//! other: a pod may be seen before its ReplicaSet, which is why workload
//! ownership is re-read from the registry every time a pod is processed.

mod node;
mod pod;
mod replicaset;
mod service;

pub use node::NodeReconciler;
pub use pod::{DsfHooks, PodReconciler};
pub use replicaset::ReplicaSetReconciler;
pub use service::ServiceReconciler;

use crate::watch::ResourceEvent;
use async_trait::async_trait;

#[async_trait]
pub trait Reconcile<T>: Send + Sync {
    async fn reconcile(&self, event: ResourceEvent<T>);
}
