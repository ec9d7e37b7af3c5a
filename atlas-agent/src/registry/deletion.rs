use crate::metadata::PodInfo;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The parts of a pod to evict once its grace period has passed
///
/// Removal is keyed by these recorded values, never by namespace/name, and
/// only touches entries still pointing at `record`. Entries rewritten by a
/// later version of the same pod are left alone.
#[derive(Debug, Clone, Default)]
pub struct DeletedPod {
    pub uid: String,
    /// The pod record the entries were registered with; falls back to `uid`
    /// when the pod was never recorded
    pub record: Option<Arc<PodInfo>>,
    /// Set when the pod registry entry itself must go
    pub name: Option<String>,
    pub namespace: String,
    pub container_ids: Vec<String>,
    pub ip: String,
    pub ports: Vec<u32>,
    pub host_ip: String,
    pub host_ports: Vec<u32>,
}

impl DeletedPod {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.container_ids.is_empty()
            && self.ports.is_empty()
            && self.host_ports.is_empty()
    }

    /// Whether an index entry pointing at `pod` was put there by this pod
    pub fn owns(&self, pod: &Arc<PodInfo>) -> bool {
        match &self.record {
            Some(record) => Arc::ptr_eq(record, pod),
            None => pod.uid == self.uid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeletionRequest {
    pub pod: DeletedPod,
    pub enqueued_at: Instant,
}

/// FIFO of pending evictions, oldest first
#[derive(Default)]
pub struct DeletionQueue {
    inner: Mutex<VecDeque<DeletionRequest>>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, pod: DeletedPod) {
        self.inner.lock().push_back(DeletionRequest {
            pod,
            enqueued_at: Instant::now(),
        });
    }

    /// Take every request at least `grace` old
    pub fn drain_expired(&self, grace: Duration) -> Vec<DeletedPod> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        while inner
            .front()
            .is_some_and(|req| now.duration_since(req.enqueued_at) >= grace)
        {
            if let Some(req) = inner.pop_front() {
                expired.push(req.pod);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
