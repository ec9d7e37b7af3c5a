//! Cluster-wide watch of one resource kind feeding a reconciler
//!
//! The API watch only reports the latest state of an object. The previous
//! validated state is remembered per key to hand reconcilers an
//! `Updated { old, new }` pair, and objects missing from a re-list are
//! reported as deleted.

use super::{ResourceEvent, WatchedObject};
use crate::error::{AgentError, Result};
use crate::reconcile::Reconcile;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client,
};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Turns raw watch events into typed add/update/delete events
pub struct EventTranslator<T> {
    seen: HashMap<String, T>,
    /// Keys listed since the last `Init`, while a re-list is in progress
    relisted: Option<HashSet<String>>,
}

impl<T> Default for EventTranslator<T> {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            relisted: None,
        }
    }
}

impl<T: WatchedObject> EventTranslator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, event: Event<T::Resource>) -> Vec<ResourceEvent<T>> {
        match event {
            Event::Init => {
                debug!("{} watcher initialized", T::KIND);
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(resource) => {
                let Some(obj) = checked::<T>(&resource) else {
                    return Vec::new();
                };
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(obj.key());
                }
                vec![self.apply(obj)]
            }
            Event::Apply(resource) => match checked::<T>(&resource) {
                Some(obj) => vec![self.apply(obj)],
                None => Vec::new(),
            },
            Event::Delete(resource) => match checked::<T>(&resource) {
                Some(obj) => {
                    self.seen.remove(&obj.key());
                    vec![ResourceEvent::Deleted(obj)]
                }
                None => Vec::new(),
            },
            Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .seen
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();
                gone.iter()
                    .filter_map(|key| self.seen.remove(key))
                    .map(ResourceEvent::Deleted)
                    .collect()
            }
        }
    }

    /// Number of objects currently known
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn apply(&mut self, new: T) -> ResourceEvent<T> {
        match self.seen.insert(new.key(), new.clone()) {
            Some(old) => ResourceEvent::Updated { old, new },
            None => ResourceEvent::Added(new),
        }
    }
}

fn checked<T: WatchedObject>(resource: &T::Resource) -> Option<T> {
    match T::validate(resource) {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!("Dropping {} event: {}", T::KIND, e);
            None
        }
    }
}

/// Watches every object of one kind and reconciles each change in order
pub struct ResourceWatcher<T: WatchedObject> {
    api: Api<T::Resource>,
    translator: EventTranslator<T>,
}

impl<T: WatchedObject> ResourceWatcher<T> {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            translator: EventTranslator::new(),
        }
    }

    /// Watch until cancelled, reconnecting with backoff
    ///
    /// `synced` fires once, after the first complete initial listing.
    pub async fn run<R>(
        mut self,
        reconciler: R,
        mut synced: Option<oneshot::Sender<()>>,
        cancel: CancellationToken,
    ) where
        R: Reconcile<T>,
    {
        info!("Starting {} watcher...", T::KIND);

        let mut backoff = INITIAL_BACKOFF;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.watch(&reconciler, &mut synced) => res,
            };

            match result {
                Ok(()) => {
                    warn!("{} watch stream ended, reconnecting...", T::KIND);
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    error!("{} watch failed: {}, reconnecting in {:?}", T::KIND, e, backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
                }
            }
        }

        info!("{} watcher stopped", T::KIND);
    }

    async fn watch<R>(&mut self, reconciler: &R, synced: &mut Option<oneshot::Sender<()>>) -> Result<()>
    where
        R: Reconcile<T>,
    {
        let mut stream = watcher::watcher(self.api.clone(), watcher::Config::default()).boxed();

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| AgentError::Kubernetes(e.to_string()))?
        {
            let init_done = matches!(event, Event::InitDone);
            for change in self.translator.translate(event) {
                reconciler.reconcile(change).await;
            }
            if init_done {
                info!(
                    "{} watcher initial sync complete. Tracking {} objects",
                    T::KIND,
                    self.translator.len()
                );
                if let Some(tx) = synced.take() {
                    let _ = tx.send(());
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::NodeObject;
    use k8s_openapi::api::core::v1::Node;
    use serde_json::json;

    fn node(name: &str, ip: &str, rv: &str) -> Node {
        serde_json::from_value(json!({
            "metadata": {"name": name, "resourceVersion": rv},
            "status": {"addresses": [{"type": "InternalIP", "address": ip}]}
        }))
        .unwrap()
    }

    fn names(events: &[ResourceEvent<NodeObject>]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                ResourceEvent::Added(n) => format!("+{}", n.name),
                ResourceEvent::Updated { new, .. } => format!("~{}", new.name),
                ResourceEvent::Deleted(n) => format!("-{}", n.name),
            })
            .collect()
    }

    #[test]
    fn test_apply_then_update_pairs_old_and_new() {
        let mut translator = EventTranslator::<NodeObject>::new();
        let added = translator.translate(Event::Apply(node("n1", "10.0.0.1", "1")));
        assert_eq!(names(&added), vec!["+n1"]);

        let updated = translator.translate(Event::Apply(node("n1", "10.0.0.9", "2")));
        match &updated[..] {
            [ResourceEvent::Updated { old, new }] => {
                assert_eq!(old.internal_ip, "10.0.0.1");
                assert_eq!(new.internal_ip, "10.0.0.9");
            }
            other => panic!("unexpected events: {:?}", other),
        }

        let deleted = translator.translate(Event::Delete(node("n1", "10.0.0.9", "3")));
        assert_eq!(names(&deleted), vec!["-n1"]);
        assert!(translator.is_empty());
    }

    #[test]
    fn test_relist_reports_vanished_objects() {
        let mut translator = EventTranslator::<NodeObject>::new();
        translator.translate(Event::Init);
        translator.translate(Event::InitApply(node("n1", "10.0.0.1", "1")));
        translator.translate(Event::InitApply(node("n2", "10.0.0.2", "1")));
        assert!(translator.translate(Event::InitDone).is_empty());

        // n2 was deleted while the watch was down
        translator.translate(Event::Init);
        let relisted = translator.translate(Event::InitApply(node("n1", "10.0.0.1", "1")));
        assert_eq!(names(&relisted), vec!["~n1"]);
        let done = translator.translate(Event::InitDone);
        assert_eq!(names(&done), vec!["-n2"]);
        assert_eq!(translator.len(), 1);
    }

    #[test]
    fn test_malformed_objects_dropped() {
        let mut translator = EventTranslator::<NodeObject>::new();
        let nameless: Node = serde_json::from_value(json!({"metadata": {}})).unwrap();
        assert!(translator.translate(Event::Apply(nameless)).is_empty());
        assert!(translator.is_empty());
    }
}
