//! Pod readiness tracking.
//!
//! A [`ReadinessTracker`] owns the pod cache of one lifecycle feed and answers
//! "which nodes currently run a ready pod" from it. Service assignment runs one
//! tracker per LoadBalancer service (pods matching the service selector in the
//! service namespace). Manual assignment runs a single cluster-wide tracker
//! over pods carrying the manual assignment label.

use crate::feed::{run_feed, Lifecycle, ObjectCache};
use futures::future::{BoxFuture, FutureExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::watcher;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Receives the lifecycle notifications of one pod feed.
pub type PodHandler = Arc<dyn Fn(Lifecycle<Pod>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`PodHandler`].
pub fn pod_handler<F, Fut>(handler: F) -> PodHandler
where
    F: Fn(Lifecycle<Pod>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| handler(event).boxed())
}

/// Which pods a feed watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodScope {
    /// `None` watches all namespaces
    pub namespace: Option<String>,
    pub label_selector: String,
}

/// Starts pod feeds.
///
/// Abstracted so assignment logic can be driven by hand in unit tests.
pub trait PodFeedLauncher: Send + Sync {
    /// Spawns a feed that keeps `pods` current and passes every notification to `handler`.
    fn launch(&self, scope: PodScope, pods: ObjectCache<Pod>, handler: PodHandler) -> JoinHandle<()>;
}

/// Launches pod feeds against the Kubernetes API.
pub struct KubePodFeeds {
    client: Client,
}

impl KubePodFeeds {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl PodFeedLauncher for KubePodFeeds {
    fn launch(&self, scope: PodScope, pods: ObjectCache<Pod>, handler: PodHandler) -> JoinHandle<()> {
        let api: Api<Pod> = match scope.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let config = watcher::Config::default().labels(&scope.label_selector);
        let feed_name = format!(
            "pod ({}, {})",
            scope.namespace.as_deref().unwrap_or("all namespaces"),
            scope.label_selector
        );

        tokio::spawn(async move {
            let result = run_feed(api, config, pods, &feed_name, |event| handler(event)).await;
            if let Err(e) = result {
                error!("Pod watcher stopped: {}", e);
            }
        })
    }
}

/// Whether the pod reports the `Ready` condition as `True`.
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
}

/// A readiness-relevant pod notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessChange {
    /// A pod was first seen already ready
    ReadyPodAdded,
    BecameReady,
    BecameUnready,
    /// A ready pod was deleted
    ReadyPodDeleted,
    /// The feed (re-)listed
    Synced,
}

/// Classifies a pod notification; `None` when readiness did not change.
pub fn readiness_change(event: &Lifecycle<Pod>) -> Option<ReadinessChange> {
    match event {
        Lifecycle::Added(pod) => pod_is_ready(pod).then_some(ReadinessChange::ReadyPodAdded),
        Lifecycle::Updated { old, new } => match (pod_is_ready(old), pod_is_ready(new)) {
            (false, true) => Some(ReadinessChange::BecameReady),
            (true, false) => Some(ReadinessChange::BecameUnready),
            _ => None,
        },
        Lifecycle::Deleted(pod) => pod_is_ready(pod).then_some(ReadinessChange::ReadyPodDeleted),
        Lifecycle::Synced => Some(ReadinessChange::Synced),
    }
}

/// Nodes hosting at least one ready pod among `pods` that satisfies `filter`.
pub fn ready_nodes<'a, I, F>(pods: I, filter: F) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a Pod>,
    F: Fn(&Pod) -> bool,
{
    pods.into_iter()
        .filter(|&pod| pod_is_ready(pod) && filter(pod))
        .filter_map(pod_node)
        .map(str::to_string)
        .collect()
}

/// Pod cache of one feed plus the task driving it.
///
/// Dropping the tracker stops its feed.
pub struct ReadinessTracker {
    pods: ObjectCache<Pod>,
    task: Option<JoinHandle<()>>,
}

impl ReadinessTracker {
    /// Starts a feed for `scope`.
    ///
    /// An empty selector selects no pods: the tracker stays empty and no feed is started.
    pub fn start(launcher: &dyn PodFeedLauncher, scope: PodScope, handler: PodHandler) -> Self {
        let pods = ObjectCache::new();
        let task = if scope.label_selector.is_empty() {
            debug!("Empty pod selector; not watching pods");
            None
        } else {
            Some(launcher.launch(scope, pods.clone(), handler))
        };
        Self { pods, task }
    }

    /// Wraps a cache whose feed is driven elsewhere.
    pub fn from_cache(pods: ObjectCache<Pod>) -> Self {
        Self { pods, task: None }
    }

    /// Whether a feed backs this tracker.
    pub fn is_watching(&self) -> bool {
        self.task.is_some()
    }

    pub fn pods(&self) -> &ObjectCache<Pod> {
        &self.pods
    }

    /// Nodes hosting at least one ready pod.
    pub fn ready_nodes(&self) -> BTreeSet<String> {
        ready_nodes(&self.pods.snapshot(), |_| true)
    }

    /// Nodes hosting a ready pod whose `label` lists `address`.
    pub fn ready_nodes_for_address(&self, label: &str, address: &str) -> BTreeSet<String> {
        ready_nodes(&self.pods.snapshot(), |pod| {
            crate::feed::label(pod, label)
                .is_some_and(|value| crate::manual::parse_address_list(value).contains(address))
        })
    }
}

impl Drop for ReadinessTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Trackers keyed by the entity they serve.
#[derive(Default)]
pub struct TrackerRegistry {
    trackers: Mutex<HashMap<String, ReadinessTracker>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tracker` under `key`, stopping any tracker it replaces.
    pub fn insert(&self, key: &str, tracker: ReadinessTracker) {
        let replaced = self
            .trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), tracker);
        drop(replaced);
    }

    /// Stops and forgets the tracker for `key`. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self
            .trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        removed.is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Ready nodes of the tracker for `key`, `None` if there is no such tracker.
    pub fn ready_nodes(&self, key: &str) -> Option<BTreeSet<String>> {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(ReadinessTracker::ready_nodes)
    }

    /// Whether the tracker for `key` has a running feed.
    pub fn is_watching(&self, key: &str) -> bool {
        self.trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(ReadinessTracker::is_watching)
    }

    pub fn len(&self) -> usize {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{pod, RecordingPodFeeds};

    #[test]
    fn test_pod_is_ready() {
        assert!(pod_is_ready(&pod("default", "web-0", "node-a", true, &[])));
        assert!(!pod_is_ready(&pod("default", "web-0", "node-a", false, &[])));

        let mut no_status = pod("default", "web-0", "node-a", true, &[]);
        no_status.status = None;
        assert!(!pod_is_ready(&no_status));
    }

    #[test]
    fn test_readiness_transitions() {
        let ready = pod("default", "web-0", "node-a", true, &[]);
        let unready = pod("default", "web-0", "node-a", false, &[]);

        assert_eq!(
            readiness_change(&Lifecycle::Added(ready.clone())),
            Some(ReadinessChange::ReadyPodAdded)
        );
        assert_eq!(readiness_change(&Lifecycle::Added(unready.clone())), None);
        assert_eq!(
            readiness_change(&Lifecycle::Updated { old: unready.clone(), new: ready.clone() }),
            Some(ReadinessChange::BecameReady)
        );
        assert_eq!(
            readiness_change(&Lifecycle::Updated { old: ready.clone(), new: unready.clone() }),
            Some(ReadinessChange::BecameUnready)
        );
        assert_eq!(
            readiness_change(&Lifecycle::Updated { old: ready.clone(), new: ready.clone() }),
            None
        );
        assert_eq!(
            readiness_change(&Lifecycle::Deleted(ready)),
            Some(ReadinessChange::ReadyPodDeleted)
        );
        assert_eq!(readiness_change(&Lifecycle::Deleted(unready)), None);
        assert_eq!(readiness_change(&Lifecycle::Synced), Some(ReadinessChange::Synced));
    }

    #[test]
    fn test_ready_nodes_skips_unready_and_unscheduled() {
        let cache = ObjectCache::new();
        cache.apply(pod("default", "a", "node-a", true, &[])).unwrap();
        cache.apply(pod("default", "b", "node-b", false, &[])).unwrap();
        cache.apply(pod("default", "c", "node-a", true, &[])).unwrap();
        let mut unscheduled = pod("default", "d", "node-d", true, &[]);
        unscheduled.spec = None;
        cache.apply(unscheduled).unwrap();

        let tracker = ReadinessTracker::from_cache(cache);
        let nodes: Vec<String> = tracker.ready_nodes().into_iter().collect();
        assert_eq!(nodes, vec!["node-a".to_string()]);
    }

    #[test]
    fn test_ready_nodes_for_address() {
        let label = "hcloud-ip-floater.cstl.dev/floating-ip";
        let cache = ObjectCache::new();
        cache.apply(pod("default", "a", "node-a", true, &[(label, "203.0.113.5,203.0.113.6")])).unwrap();
        cache.apply(pod("default", "b", "node-b", true, &[(label, "203.0.113.6")])).unwrap();
        cache.apply(pod("default", "c", "node-c", false, &[(label, "203.0.113.5")])).unwrap();

        let tracker = ReadinessTracker::from_cache(cache);
        assert_eq!(
            tracker.ready_nodes_for_address(label, "203.0.113.5"),
            BTreeSet::from(["node-a".to_string()])
        );
        assert_eq!(
            tracker.ready_nodes_for_address(label, "203.0.113.6"),
            BTreeSet::from(["node-a".to_string(), "node-b".to_string()])
        );
        assert!(tracker.ready_nodes_for_address(label, "198.51.100.1").is_empty());
    }

    #[tokio::test]
    async fn test_empty_selector_starts_no_feed() {
        let launcher = RecordingPodFeeds::default();
        let handler = pod_handler(|_| async {});

        let tracker = ReadinessTracker::start(
            &launcher,
            PodScope { namespace: Some("default".to_string()), label_selector: String::new() },
            handler,
        );

        assert!(!tracker.is_watching());
        assert!(launcher.scopes().is_empty());
    }

    #[tokio::test]
    async fn test_registry_replaces_and_removes() {
        let launcher = RecordingPodFeeds::default();
        let handler = pod_handler(|_| async {});
        let scope = PodScope { namespace: Some("default".to_string()), label_selector: "app=web".to_string() };
        let registry = TrackerRegistry::new();

        registry.insert("default/web", ReadinessTracker::start(&launcher, scope.clone(), handler.clone()));
        registry.insert("default/web", ReadinessTracker::start(&launcher, scope, handler));

        assert_eq!(registry.len(), 1);
        assert_eq!(launcher.scopes().len(), 2);
        assert!(registry.is_watching("default/web"));
        assert_eq!(registry.ready_nodes("default/web"), Some(BTreeSet::new()));

        assert!(registry.remove("default/web"));
        assert!(!registry.remove("default/web"));
        assert_eq!(registry.ready_nodes("default/web"), None);
    }
}
