//! Builders for the objects derived from a Deployment.
//!
//! Everything here is a pure function of the source Deployment and the
//! [`ExposurePolicy`], so the same input always yields the same desired
//! object. Comparison against live objects only looks at the fields this
//! controller manages; server defaulted fields are left alone.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    Ingress, IngressBackend, IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, ObjectKey, Result};

pub static MANAGER_NAME: &str = "ekspose";
pub static MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub static OWNER_ANNOTATION: &str = "ekspose.dev/owner";

/// How a Deployment is exposed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExposurePolicy {
    /// Port the Service (and Ingress backend) listens on
    pub port: i32,
    /// Name of the single Service port
    pub port_name: String,
    /// `ingressClassName` of derived Ingresses; left to the cluster default when unset
    pub ingress_class: Option<String>,
}

impl Default for ExposurePolicy {
    fn default() -> Self {
        Self {
            port: 80,
            port_name: "http".to_string(),
            ingress_class: None,
        }
    }
}

/// Labels of the Deployment's pod template, which the derived Service selects on.
pub fn selector_labels(source: &Deployment) -> Option<BTreeMap<String, String>> {
    source
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .filter(|labels| !labels.is_empty())
}

/// First container port declared in the pod template.
pub fn declared_port(source: &Deployment) -> Option<i32> {
    source
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| {
            pod.containers
                .iter()
                .filter_map(|c| c.ports.as_ref())
                .flatten()
                .map(|p| p.container_port)
                .next()
        })
}

/// The owner back-reference stored on a derived object.
pub fn owner_key<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(OWNER_ANNOTATION))
        .map(String::as_str)
}

pub fn is_owned_by<K: Resource>(obj: &K, key: &ObjectKey) -> bool {
    owner_key(obj) == Some(key.to_string().as_str())
}

fn derived_meta(key: &ObjectKey) -> ObjectMeta {
    ObjectMeta {
        name: Some(key.name.clone()),
        namespace: key.namespace.clone(),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGER_NAME.to_string(),
        )])),
        annotations: Some(BTreeMap::from([(
            OWNER_ANNOTATION.to_string(),
            key.to_string(),
        )])),
        ..ObjectMeta::default()
    }
}

fn has_managed_meta<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY_LABEL))
        .is_some_and(|v| v == MANAGER_NAME)
}

fn stamp_managed_meta<K: Resource>(obj: &mut K, key: &ObjectKey) {
    obj.labels_mut()
        .insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());
    obj.annotations_mut()
        .insert(OWNER_ANNOTATION.to_string(), key.to_string());
}

fn require_selector(source: &Deployment, key: &ObjectKey) -> Result<BTreeMap<String, String>> {
    selector_labels(source).ok_or_else(|| {
        Error::InvalidSource(key.to_string(), "pod template has no labels".to_string())
    })
}

/// A kind of object derived from a Deployment.
pub trait Derived:
    Resource<DynamicType = ()> + Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: &'static str;

    /// Desired object for `source`, which is addressed by `key`.
    fn desired(source: &Deployment, key: &ObjectKey, policy: &ExposurePolicy) -> Result<Self>;

    /// True when every field this controller manages already has its desired value.
    fn matches(live: &Self, desired: &Self) -> bool;

    /// `live` with the managed fields overwritten from `desired`.
    fn merge(live: &Self, desired: &Self, key: &ObjectKey) -> Self;
}

impl Derived for Service {
    const KIND: &'static str = "Service";

    fn desired(source: &Deployment, key: &ObjectKey, policy: &ExposurePolicy) -> Result<Self> {
        let selector = require_selector(source, key)?;
        let target_port = declared_port(source).unwrap_or(policy.port);
        Ok(Service {
            metadata: derived_meta(key),
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    name: Some(policy.port_name.clone()),
                    port: policy.port,
                    target_port: Some(IntOrString::Int(target_port)),
                    protocol: Some("TCP".to_string()),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        })
    }

    fn matches(live: &Self, desired: &Self) -> bool {
        has_managed_meta(live) && service_shape(live) == service_shape(desired)
    }

    fn merge(live: &Self, desired: &Self, key: &ObjectKey) -> Self {
        let mut merged = live.clone();
        stamp_managed_meta(&mut merged, key);
        let live_ports = live
            .spec
            .as_ref()
            .and_then(|s| s.ports.clone())
            .unwrap_or_default();
        let desired_spec = desired.spec.clone().unwrap_or_default();
        let spec = merged.spec.get_or_insert_with(ServiceSpec::default);
        spec.selector = desired_spec.selector;
        spec.ports = desired_spec.ports.map(|ports| {
            ports
                .into_iter()
                .map(|mut port| {
                    // keep an allocated node port so NodePort services stay stable
                    port.node_port = live_ports
                        .iter()
                        .find(|p| p.name == port.name)
                        .and_then(|p| p.node_port);
                    port
                })
                .collect()
        });
        merged
    }
}

#[derive(Debug, PartialEq)]
struct PortShape {
    name: Option<String>,
    port: i32,
    target_port: Option<IntOrString>,
    protocol: String,
}

fn service_shape(svc: &Service) -> (Option<BTreeMap<String, String>>, Vec<PortShape>) {
    let spec = svc.spec.as_ref();
    let selector = spec.and_then(|s| s.selector.clone());
    let ports = spec
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| PortShape {
                    name: p.name.clone(),
                    port: p.port,
                    target_port: p.target_port.clone(),
                    protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                })
                .collect()
        })
        .unwrap_or_default();
    (selector, ports)
}

impl Derived for Ingress {
    const KIND: &'static str = "Ingress";

    // Placeholder routing: the whole host goes to the derived Service, no rules.
    fn desired(source: &Deployment, key: &ObjectKey, policy: &ExposurePolicy) -> Result<Self> {
        require_selector(source, key)?;
        Ok(Ingress {
            metadata: derived_meta(key),
            spec: Some(IngressSpec {
                ingress_class_name: policy.ingress_class.clone(),
                default_backend: Some(IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: key.name.clone(),
                        port: Some(ServiceBackendPort {
                            number: Some(policy.port),
                            name: None,
                        }),
                    }),
                    resource: None,
                }),
                ..IngressSpec::default()
            }),
            ..Ingress::default()
        })
    }

    fn matches(live: &Self, desired: &Self) -> bool {
        let live_spec = live.spec.clone().unwrap_or_default();
        let desired_spec = desired.spec.clone().unwrap_or_default();
        // an unset class may be filled in by the cluster's default class admission
        let class_matches = desired_spec.ingress_class_name.is_none()
            || live_spec.ingress_class_name == desired_spec.ingress_class_name;
        has_managed_meta(live)
            && class_matches
            && live_spec.default_backend == desired_spec.default_backend
    }

    fn merge(live: &Self, desired: &Self, key: &ObjectKey) -> Self {
        let mut merged = live.clone();
        stamp_managed_meta(&mut merged, key);
        let desired_spec = desired.spec.clone().unwrap_or_default();
        let spec = merged.spec.get_or_insert_with(IngressSpec::default);
        spec.default_backend = desired_spec.default_backend;
        if desired_spec.ingress_class_name.is_some() {
            spec.ingress_class_name = desired_spec.ingress_class_name;
        }
        merged
    }
}
