//! Translates watch events into work queue keys.
//!
//! The router owns the reflector writer: every event is applied to the
//! object cache first and then handed to an [`EventHandler`] as an add,
//! update or delete notification.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::Resource;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::*;

use crate::ObjectKey;
use crate::cache::{ObjectCache, ReflectorCache};
use crate::queue::WorkQueue;

/// Receives change notifications for objects of kind `K`.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, obj: &K);
    fn on_delete(&self, obj: &K);
}

/// Pushes the key of every notified object onto a work queue. Duplicate keys
/// are coalesced by the queue.
pub struct EnqueueHandler {
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl EnqueueHandler {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        Self { queue }
    }

    fn enqueue<K: Resource>(&self, obj: &K, event: &str) {
        match ObjectKey::from_object(obj) {
            Ok(key) => {
                debug!("{} {}, enqueueing", event, key);
                self.queue.add(key);
            }
            Err(e) => warn!("Dropping {} notification: {}", event, e),
        }
    }
}

impl<K: Resource> EventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &K) {
        self.enqueue(obj, "add");
    }

    fn on_update(&self, obj: &K) {
        self.enqueue(obj, "update");
    }

    fn on_delete(&self, obj: &K) {
        self.enqueue(obj, "delete");
    }
}

/// Objects known before a relist started, and keys seen since.
struct Relist<K> {
    before: Vec<Arc<K>>,
    seen: Vec<K>,
}

pub struct EventRouter<K, H>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Writer<K>,
    cache: ReflectorCache<K>,
    handler: H,
    relist: Option<Relist<K>>,
}

impl<K, H> EventRouter<K, H>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    H: EventHandler<K>,
{
    pub fn new(writer: Writer<K>, cache: ReflectorCache<K>, handler: H) -> Self {
        Self {
            writer,
            cache,
            handler,
            relist: None,
        }
    }

    fn known(&self, obj: &K) -> bool {
        ObjectKey::from_object(obj)
            .ok()
            .is_some_and(|key| self.cache.get(&key).is_some())
    }

    /// Apply one watch event to the cache and notify the handler.
    pub fn apply(&mut self, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Init => {
                debug!("Watch (re)list started");
                self.relist = Some(Relist {
                    before: self.cache.store().state(),
                    seen: Vec::new(),
                });
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(obj) => {
                // buffered by the writer until InitDone, so notify then
                if let Some(relist) = self.relist.as_mut() {
                    relist.seen.push(obj.clone());
                }
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitDone => {
                self.writer.apply_watcher_event(&event);
                self.finish_relist();
                self.cache.mark_synced();
            }
            watcher::Event::Apply(obj) => {
                let existed = self.known(obj);
                self.writer.apply_watcher_event(&event);
                if existed {
                    self.handler.on_update(obj);
                } else {
                    self.handler.on_add(obj);
                }
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                self.handler.on_delete(obj);
            }
        }
    }

    fn finish_relist(&mut self) {
        let Some(relist) = self.relist.take() else {
            return;
        };
        let before: HashSet<ObjectKey> = relist
            .before
            .iter()
            .filter_map(|obj| ObjectKey::from_object(obj.as_ref()).ok())
            .collect();
        let mut seen = HashSet::new();
        for obj in &relist.seen {
            match ObjectKey::from_object(obj) {
                Ok(key) if before.contains(&key) => {
                    seen.insert(key);
                    self.handler.on_update(obj);
                }
                Ok(key) => {
                    seen.insert(key);
                    self.handler.on_add(obj);
                }
                Err(_) => self.handler.on_add(obj),
            }
        }
        // objects deleted while the watch was down never get a Delete event
        for obj in &relist.before {
            let gone = ObjectKey::from_object(obj.as_ref()).is_ok_and(|key| !seen.contains(&key));
            if gone {
                self.handler.on_delete(obj.as_ref());
            }
        }
        debug!("Watch relist done with {} objects", relist.seen.len());
    }

    /// Notify an update for every object currently known.
    pub fn resync(&self) {
        let objects = self.cache.store().state();
        debug!("Resyncing {} objects", objects.len());
        for obj in objects {
            self.handler.on_update(obj.as_ref());
        }
    }

    /// Drive the router from a watch stream until it ends, resyncing every
    /// `resync_period` (never when zero).
    pub async fn run<S>(mut self, stream: S, resync_period: Duration)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    {
        let mut stream = std::pin::pin!(stream);
        let period = if resync_period.is_zero() {
            // effectively never
            Duration::from_secs(60 * 60 * 24 * 365)
        } else {
            resync_period
        };
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!("Watch error: {}", e),
                    None => break,
                },
                _ = resync.tick(), if !resync_period.is_zero() => self.resync(),
            }
        }
        warn!("Watch stream ended");
    }
}
