//! Lifecycle feeds on top of `kube_runtime::watcher`.
//!
//! The watcher only reports "object applied" and "object deleted". Assignment
//! logic needs old/new pairs to detect readiness transitions and label
//! changes, so every feed keeps an [`ObjectCache`] of the last seen version of
//! each object and turns watcher events into [`Lifecycle`] notifications.
//! The cache doubles as the feed's synchronous snapshot query.
//!
//! Re-lists (`Init` .. `InitDone`) are diffed against the cache: objects that
//! vanished while the watch was down are reported as deleted, and completion
//! of the list is reported as [`Lifecycle::Synced`].

use crate::error::ControllerError;
use futures::StreamExt;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// A change to a watched object.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle<K> {
    /// First sighting of an object
    Added(K),
    /// A known object changed
    Updated { old: K, new: K },
    /// The object is gone; carries the last known version
    Deleted(K),
    /// The feed finished (re-)listing and the cache is complete
    Synced,
}

/// Last known version of every object seen by a feed, keyed by `namespace/name`.
#[derive(Debug)]
pub struct ObjectCache<K> {
    objects: Arc<RwLock<BTreeMap<String, K>>>,
}

impl<K> Clone for ObjectCache<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

/// Cache key of an object: `namespace/name`, or just `name` for cluster-scoped objects.
pub fn object_key<K: Resource>(obj: &K) -> Result<String, ControllerError> {
    let meta = obj.meta();
    let name = meta.name.as_deref().ok_or(ControllerError::MissingMetadata("metadata.name"))?;
    Ok(match meta.namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    })
}

impl<K: Resource + Clone> ObjectCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<K> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Point-in-time copy of all cached objects
    pub fn snapshot(&self) -> Vec<K> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stores `obj` and reports whether it was new or an update.
    pub fn apply(&self, obj: K) -> Result<Lifecycle<K>, ControllerError> {
        let key = object_key(&obj)?;
        let old = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, obj.clone());
        Ok(match old {
            Some(old) => Lifecycle::Updated { old, new: obj },
            None => Lifecycle::Added(obj),
        })
    }

    /// Drops `obj`, reporting the last cached version when there was one.
    pub fn delete(&self, obj: K) -> Result<Lifecycle<K>, ControllerError> {
        let key = object_key(&obj)?;
        let old = self.objects.write().unwrap_or_else(PoisonError::into_inner).remove(&key);
        Ok(Lifecycle::Deleted(old.unwrap_or(obj)))
    }

    /// Removes every object whose key is not in `keep`, returning the removed objects.
    fn retain(&self, keep: &HashSet<String>) -> Vec<K> {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let gone: Vec<String> = objects.keys().filter(|k| !keep.contains(*k)).cloned().collect();
        gone.into_iter().filter_map(|k| objects.remove(&k)).collect()
    }
}

/// Turns raw watcher events into lifecycle notifications for one feed.
#[derive(Debug)]
pub struct FeedState<K> {
    cache: ObjectCache<K>,
    relisted: Option<HashSet<String>>,
}

impl<K: Resource + Clone> FeedState<K> {
    pub fn new(cache: ObjectCache<K>) -> Self {
        Self { cache, relisted: None }
    }

    /// Applies one watcher event to the cache and returns the resulting notifications.
    ///
    /// Objects without a name cannot be keyed; they are logged and dropped.
    pub fn observe(&mut self, event: watcher::Event<K>) -> Vec<Lifecycle<K>> {
        let result = match event {
            watcher::Event::Apply(obj) => self.cache.apply(obj).map(|n| vec![n]),
            watcher::Event::Delete(obj) => self.cache.delete(obj).map(|n| vec![n]),
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Ok(Vec::new())
            }
            watcher::Event::InitApply(obj) => object_key(&obj).and_then(|key| {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(key);
                }
                self.cache.apply(obj).map(|n| vec![n])
            }),
            watcher::Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                let mut notifications: Vec<Lifecycle<K>> =
                    self.cache.retain(&seen).into_iter().map(Lifecycle::Deleted).collect();
                notifications.push(Lifecycle::Synced);
                Ok(notifications)
            }
        };

        result.unwrap_or_else(|e| {
            error!("Dropping watch event with unexpected shape: {}", e);
            Vec::new()
        })
    }
}

/// Runs a watch on `api` forever, feeding lifecycle notifications to `handler`
/// one at a time in delivery order.
///
/// Stream errors are logged; the watcher's backoff re-establishes the watch.
pub async fn run_feed<K, F, Fut>(
    api: Api<K>,
    config: watcher::Config,
    cache: ObjectCache<K>,
    feed_name: &str,
    mut handler: F,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    F: FnMut(Lifecycle<K>) -> Fut,
    Fut: Future<Output = ()>,
{
    info!("Starting {} watcher", feed_name);

    let mut state = FeedState::new(cache);
    let mut stream = Box::pin(watcher(api, config).default_backoff());

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("{} watch error (will retry): {}", feed_name, e);
                continue;
            }
        };

        for notification in state.observe(event) {
            if let Lifecycle::Synced = notification {
                debug!("{} watcher synced", feed_name);
            }
            handler(notification).await;
        }
    }

    Err(ControllerError::Watch(format!("{} watch stream ended", feed_name)))
}

/// Label of an object, if set.
pub fn label<'a, K: Resource>(obj: &'a K, name: &str) -> Option<&'a str> {
    obj.labels().get(name).map(String::as_str)
}
