use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use kube::runtime::events::Recorder;
use tracing::*;

use crate::cache::ObjectCache;
use crate::client::{ApiError, ObjectClient};
use crate::derived::{Derived, ExposurePolicy, is_owned_by};
use crate::events_helper::emit_info;
use crate::{Error, ObjectKey, Result};

/// What a reconcile did to one derived object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Deleted,
    /// Already converged
    Unchanged,
    /// Nothing of ours exists and nothing should
    Absent,
    /// A concurrent writer changed or removed the object first; the next
    /// pass picks it up again
    Superseded,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub changes: Vec<(&'static str, Change)>,
}

impl Outcome {
    fn push(&mut self, kind: &'static str, change: Change) {
        self.changes.push((kind, change));
    }

    pub fn change(&self, kind: &str) -> Option<Change> {
        self.changes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, c)| *c)
    }

    /// True when no cluster object was mutated.
    pub fn is_noop(&self) -> bool {
        self.changes
            .iter()
            .all(|(_, c)| matches!(c, Change::Unchanged | Change::Absent))
    }
}

/// Unit of work run by the worker loop for a single key.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()>;
}

/// Converges the Service (and optionally Ingress) derived from a Deployment.
///
/// Every call is a one-shot convergence pass: it never retries, and treats
/// "already exists", "not found" and "conflict" answers to mutating calls as
/// success, since an earlier partial pass may already have done the work.
pub struct Reconciler<C, A> {
    cache: C,
    api: A,
    policy: ExposurePolicy,
    manage_ingress: bool,
    recorder: Option<Recorder>,
}

impl<C, A> Reconciler<C, A>
where
    C: ObjectCache<Deployment>,
    A: ObjectClient<Service> + ObjectClient<Ingress>,
{
    pub fn new(cache: C, api: A, policy: ExposurePolicy) -> Self {
        Self {
            cache,
            api,
            policy,
            manage_ingress: false,
            recorder: None,
        }
    }

    pub fn with_ingress(mut self, manage_ingress: bool) -> Self {
        self.manage_ingress = manage_ingress;
        self
    }

    pub fn with_recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Bring the objects derived from the Deployment at `key` in line with it.
    pub async fn sync(&self, key: &ObjectKey) -> Result<Outcome> {
        let ns = key
            .namespace
            .as_deref()
            .ok_or_else(|| Error::InvalidKey(format!("{key} is not namespaced")))?;
        let mut outcome = Outcome::default();

        match self.cache.get(key) {
            None => {
                debug!("Deployment {} not in cache, cleaning up derived objects", key);
                // an Ingress may be left over from a run with ingress management enabled
                outcome.push(Ingress::KIND, self.cleanup::<Ingress>(key, ns).await?);
                outcome.push(Service::KIND, self.cleanup::<Service>(key, ns).await?);
            }
            Some(dep) => {
                debug!(
                    "Deployment {} at resourceVersion {}",
                    key,
                    dep.resource_version().unwrap_or_default()
                );
                outcome.push(Service::KIND, self.converge::<Service>(&dep, key, ns).await?);
                if self.manage_ingress {
                    outcome.push(Ingress::KIND, self.converge::<Ingress>(&dep, key, ns).await?);
                }
            }
        }
        Ok(outcome)
    }

    async fn converge<K>(&self, source: &Deployment, key: &ObjectKey, ns: &str) -> Result<Change>
    where
        K: Derived,
        A: ObjectClient<K>,
    {
        let desired = K::desired(source, key, &self.policy)?;
        let live = match <A as ObjectClient<K>>::get(&self.api, ns, &key.name).await {
            Ok(live) => live,
            Err(ApiError::NotFound) => {
                return match <A as ObjectClient<K>>::create(&self.api, ns, &desired).await {
                    Ok(_) => {
                        info!("Created {} {}", K::KIND, key);
                        emit_info(
                            self.recorder.as_ref(),
                            source,
                            &format!("{}Created", K::KIND),
                            "Created",
                            Some(format!("Created {} `{}`", K::KIND, key.name)),
                        )
                        .await;
                        Ok(Change::Created)
                    }
                    Err(ApiError::AlreadyExists) => {
                        debug!("{} {} created concurrently", K::KIND, key);
                        Ok(Change::Superseded)
                    }
                    Err(e) => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        if !is_owned_by(&live, key) {
            return Err(Error::NotOwned {
                kind: K::KIND,
                key: key.to_string(),
            });
        }
        if K::matches(&live, &desired) {
            debug!("{} {} is up to date", K::KIND, key);
            return Ok(Change::Unchanged);
        }

        let merged = K::merge(&live, &desired, key);
        match <A as ObjectClient<K>>::replace(&self.api, ns, &key.name, &merged).await {
            Ok(_) => {
                info!("Updated {} {}", K::KIND, key);
                emit_info(
                    self.recorder.as_ref(),
                    source,
                    &format!("{}Updated", K::KIND),
                    "Updated",
                    Some(format!("Updated {} `{}`", K::KIND, key.name)),
                )
                .await;
                Ok(Change::Updated)
            }
            Err(ApiError::NotFound) | Err(ApiError::Conflict) => {
                debug!("{} {} changed during update, leaving it for resync", K::KIND, key);
                Ok(Change::Superseded)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup<K>(&self, key: &ObjectKey, ns: &str) -> Result<Change>
    where
        K: Derived,
        A: ObjectClient<K>,
    {
        let live = match <A as ObjectClient<K>>::get(&self.api, ns, &key.name).await {
            Ok(live) => live,
            Err(ApiError::NotFound) => return Ok(Change::Absent),
            Err(e) => return Err(e.into()),
        };
        if !is_owned_by(&live, key) {
            info!("{} {} is not managed by us, leaving it in place", K::KIND, key);
            return Ok(Change::Absent);
        }
        match <A as ObjectClient<K>>::delete(&self.api, ns, &key.name).await {
            Ok(()) => {
                info!("Deleted {} {}", K::KIND, key);
                Ok(Change::Deleted)
            }
            Err(ApiError::NotFound) => Ok(Change::Absent),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<C, A> Reconcile for Reconciler<C, A>
where
    C: ObjectCache<Deployment>,
    A: ObjectClient<Service> + ObjectClient<Ingress>,
{
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        info!("Reconciling Deployment \"{}\"", key);
        let outcome = self.sync(key).await?;
        if !outcome.is_noop() {
            info!("Reconciled {}: {:?}", key, outcome.changes);
        }
        Ok(())
    }
}
