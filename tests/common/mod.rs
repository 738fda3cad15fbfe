#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ekspose::ObjectKey;
use ekspose::cache::ObjectCache;
use ekspose::client::{ApiError, ObjectClient};
use ekspose::derived::Derived;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::core::ErrorResponse;

pub fn deployment(ns: &str, name: &str, labels: &[(&str, &str)], port: Option<i32>) -> Deployment {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ns.into()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.into(),
                        ports: port.map(|p| {
                            vec![ContainerPort {
                                container_port: p,
                                ..ContainerPort::default()
                            }]
                        }),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

fn api_error(code: u16, reason: &str) -> ApiError {
    ApiError::from(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: format!("injected {reason}"),
        reason: reason.into(),
        code,
    }))
}

type StoreKey = (&'static str, String, String);

#[derive(Default)]
struct Cluster {
    objects: BTreeMap<StoreKey, serde_json::Value>,
    mutations: Vec<String>,
    failures: HashMap<&'static str, Vec<(u16, String)>>,
    version: u64,
}

impl Cluster {
    fn injected(&mut self, op: &'static str) -> Result<(), ApiError> {
        match self.failures.get_mut(op).and_then(|f| f.pop()) {
            Some((code, reason)) => Err(api_error(code, &reason)),
            None => Ok(()),
        }
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// In-memory API server for derived objects.
#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<Cluster>>,
}

impl FakeCluster {
    /// Make the next `op` ("get", "create", "replace", "delete") call fail.
    pub fn fail_next(&self, op: &'static str, code: u16, reason: &str) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push((code, reason.to_string()));
    }

    /// Store an object as if someone else had created it.
    pub fn put<K: Derived>(&self, obj: &K) {
        let mut inner = self.inner.lock().unwrap();
        let meta = obj.meta();
        let key = (
            K::KIND,
            meta.namespace.clone().unwrap(),
            meta.name.clone().unwrap(),
        );
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = Some(inner.next_version());
        inner.objects.insert(key, serde_json::to_value(&obj).unwrap());
    }

    pub fn fetch<K: Derived>(&self, ns: &str, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(K::KIND, ns.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn mutations(&self) -> Vec<String> {
        self.inner.lock().unwrap().mutations.clone()
    }
}

#[async_trait]
impl<K: Derived> ObjectClient<K> for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.injected("get")?;
        inner
            .objects
            .get(&(K::KIND, namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
            .ok_or(ApiError::NotFound)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.injected("create")?;
        let name = obj.meta().name.clone().unwrap();
        let key = (K::KIND, namespace.to_string(), name.clone());
        if inner.objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists);
        }
        let mut created = obj.clone();
        created.meta_mut().resource_version = Some(inner.next_version());
        inner.objects.insert(key, serde_json::to_value(&created).unwrap());
        inner.mutations.push(format!("create {} {}/{}", K::KIND, namespace, name));
        Ok(created)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.injected("replace")?;
        let key = (K::KIND, namespace.to_string(), name.to_string());
        let stored: K = match inner.objects.get(&key) {
            Some(v) => serde_json::from_value(v.clone()).unwrap(),
            None => return Err(ApiError::NotFound),
        };
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(ApiError::Conflict);
        }
        let mut replaced = obj.clone();
        replaced.meta_mut().resource_version = Some(inner.next_version());
        inner.objects.insert(key, serde_json::to_value(&replaced).unwrap());
        inner.mutations.push(format!("replace {} {}/{}", K::KIND, namespace, name));
        Ok(replaced)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.injected("delete")?;
        let key = (K::KIND, namespace.to_string(), name.to_string());
        if inner.objects.remove(&key).is_none() {
            return Err(ApiError::NotFound);
        }
        inner.mutations.push(format!("delete {} {}/{}", K::KIND, namespace, name));
        Ok(())
    }
}

/// Deployment cache filled by hand.
#[derive(Clone, Default)]
pub struct MapCache {
    objects: Arc<Mutex<HashMap<ObjectKey, Arc<Deployment>>>>,
    synced: Arc<AtomicBool>,
}

impl MapCache {
    pub fn synced() -> Self {
        let cache = Self::default();
        cache.synced.store(true, Ordering::SeqCst);
        cache
    }

    pub fn insert(&self, dep: Deployment) {
        let key = ObjectKey::from_object(&dep).unwrap();
        self.objects.lock().unwrap().insert(key, Arc::new(dep));
    }

    pub fn remove(&self, key: &ObjectKey) {
        self.objects.lock().unwrap().remove(key);
    }
}

impl ObjectCache<Deployment> for MapCache {
    fn get(&self, key: &ObjectKey) -> Option<Arc<Deployment>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}
