use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kube::Resource;
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::*;

use crate::{Error, ObjectKey, Result};

/// Read-only view of the locally mirrored cluster state.
pub trait ObjectCache<K>: Send + Sync {
    /// Point lookup; `None` when the object is not (or no longer) known.
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>>;

    /// True once the initial listing has been fully mirrored.
    fn has_synced(&self) -> bool;
}

/// [`ObjectCache`] over a kube reflector store.
///
/// The store is written by the event router, which also flips the synced
/// flag once the watcher reports the end of its initial listing.
pub struct ReflectorCache<K: Resource<DynamicType = ()> + 'static> {
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K: Resource<DynamicType = ()> + 'static> Clone for ReflectorCache<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(store: Store<K>) -> Self {
        Self {
            store,
            synced: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::SeqCst) {
            info!("Object cache synced with {} objects", self.store.state().len());
        }
    }

    pub fn store(&self) -> &Store<K> {
        &self.store
    }
}

impl<K> ObjectCache<K> for ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut oref = ObjectRef::<K>::new(&key.name);
        if let Some(ns) = &key.namespace {
            oref = oref.within(ns);
        }
        self.store.get(&oref)
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Poll `has_synced` until it holds or `timeout` expires.
///
/// Reconciling against a cold cache would report existing objects as
/// deleted, so a timeout here is fatal for the controller.
pub async fn wait_for_cache_sync<K, C>(cache: &C, timeout: Duration) -> Result<()>
where
    C: ObjectCache<K> + ?Sized,
{
    let poll = async {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            if cache.has_synced() {
                return;
            }
            trace!("waiting for object cache to sync");
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| Error::CacheSync(timeout))
}
