//! Keyed stores of cluster objects, each behind its own read-write lock

mod deletion;
mod node;
mod pod;
mod replicaset;
mod service;

pub use deletion::{DeletedPod, DeletionQueue, DeletionRequest};
pub use node::NodeRegistry;
pub use pod::PodRegistry;
pub use replicaset::ReplicaSetRegistry;
pub use service::ServiceRegistry;

use crate::metadata::Labels;

/// True when every selector pair is present in `labels`
///
/// An empty selector selects nothing.
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    !selector.is_empty()
        && selector
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
}
