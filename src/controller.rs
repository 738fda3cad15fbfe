use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        WatchStreamExt,
        events::{Recorder, Reporter},
        reflector, watcher,
    },
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::*;

use crate::cache::{ObjectCache, ReflectorCache, wait_for_cache_sync};
use crate::client::KubeClient;
use crate::config::Config;
use crate::queue::WorkQueue;
use crate::reconciler::{Reconcile, Reconciler};
use crate::router::{EnqueueHandler, EventRouter};
use crate::worker::spawn_workers;
use crate::{ObjectKey, Result};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub reconciled: u64,
    pub failed: u64,
    pub dropped: u64,
    pub queue_depth: usize,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reconciled: 0,
            failed: 0,
            dropped: 0,
            queue_depth: 0,
            last_error: None,
            reporter: "ekspose-controller".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }

    pub(crate) fn record(&mut self, key: &ObjectKey, res: &Result<()>, queue_depth: usize) {
        self.last_event = Utc::now();
        self.queue_depth = queue_depth;
        match res {
            Ok(()) => self.reconciled += 1,
            Err(e) if e.is_permanent() => {
                self.dropped += 1;
                self.last_error = Some(format!("{key}: {e}"));
            }
            Err(e) => {
                self.failed += 1;
                self.last_error = Some(format!("{key}: {e}"));
            }
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the workers
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub(crate) fn shared(&self) -> Arc<RwLock<Diagnostics>> {
        self.diagnostics.clone()
    }
}

/// Worker side settings of a controller run.
#[derive(Clone, Debug)]
pub struct RunSettings {
    pub workers: usize,
    pub reconcile_timeout: Duration,
    pub cache_sync_timeout: Duration,
}

impl From<&Config> for RunSettings {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers(),
            reconcile_timeout: config.reconcile_timeout.into(),
            cache_sync_timeout: config.cache_sync_timeout.into(),
        }
    }
}

/// Wait for `cache` to sync, drain `queue` with `settings.workers` workers
/// until `stop` resolves, then shut the queue down and wait for in-flight
/// reconciles to finish.
///
/// Returns [`crate::Error::CacheSync`] without starting any worker when the cache
/// does not sync in time.
pub async fn run_until<C, R, F>(
    queue: Arc<WorkQueue<ObjectKey>>,
    cache: &C,
    reconciler: Arc<R>,
    settings: RunSettings,
    state: &State,
    stop: F,
) -> Result<()>
where
    C: ObjectCache<Deployment>,
    R: Reconcile + 'static,
    F: Future<Output = ()>,
{
    let mut stop = std::pin::pin!(stop);
    tokio::select! {
        synced = wait_for_cache_sync::<Deployment, C>(cache, settings.cache_sync_timeout) => {
            if let Err(e) = synced {
                error!("{}", e);
                queue.shut_down();
                return Err(e);
            }
        }
        _ = stop.as_mut() => {
            info!("Stopped before the cache synced");
            queue.shut_down();
            return Ok(());
        }
    }

    info!("Starting {} workers", settings.workers);
    let workers = spawn_workers(
        queue.clone(),
        reconciler,
        settings.workers,
        settings.reconcile_timeout,
        state.shared(),
    );

    stop.await;
    info!("Stop requested, draining workers");
    queue.shut_down();
    for res in futures::future::join_all(workers).await {
        if let Err(e) = res {
            error!("Worker ended abnormally: {}", e);
        }
    }
    info!("All workers stopped");
    Ok(())
}

/// Exposes Deployments through derived Services (and optionally Ingresses).
pub struct Controller {
    client: Client,
    config: Config,
    state: State,
}

impl Controller {
    pub fn new(client: Client, config: Config, state: State) -> Self {
        Self {
            client,
            config,
            state,
        }
    }

    /// Run until `stop` resolves and every worker has drained.
    pub async fn start<F: Future<Output = ()>>(self, stop: F) -> Result<()> {
        let config = &self.config;
        let deployments: Api<Deployment> = match &config.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let queue = Arc::new(WorkQueue::with_backoff(
            config.backoff_base.into(),
            config.backoff_max.into(),
        ));

        if config.resync_disabled() {
            warn!("Resync disabled; objects that lost a write race stay stale until their Deployment changes");
        }
        let (store, writer) = reflector::store();
        let cache = ReflectorCache::new(store);
        let router = EventRouter::new(writer, cache.clone(), EnqueueHandler::new(queue.clone()));
        let stream = watcher(deployments, config.watcher_config()).default_backoff();
        let router_task = tokio::spawn(router.run(stream, config.resync_period.into()));

        let recorder = self.state.diagnostics.read().await.recorder(self.client.clone());
        let reconciler = Reconciler::new(
            cache.clone(),
            KubeClient::new(self.client.clone()),
            config.policy(),
        )
        .with_ingress(config.manage_ingress)
        .with_recorder(recorder);

        info!(
            "Starting controller for Deployments in {}",
            config.namespace.as_deref().unwrap_or("all namespaces")
        );
        let res = run_until(
            queue,
            &cache,
            Arc::new(reconciler),
            RunSettings::from(config),
            &self.state,
            stop,
        )
        .await;
        router_task.abort();
        res
    }
}
