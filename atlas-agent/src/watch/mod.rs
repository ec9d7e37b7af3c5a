//! Kubernetes watch boundary
//!
//! Raw API objects are validated once here into typed objects; reconcilers
//! never see anything else.

mod objects;
mod watcher;

pub use objects::{
    ContainerSpec, ContainerState, NodeObject, OwnerRef, PodObject, PortSpec, ReplicaSetObject,
    ServiceObject, ServicePortSpec, WatchedObject,
};
pub use watcher::{EventTranslator, ResourceWatcher};

/// A change to one watched object
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}
