use std::fmt;
use std::str::FromStr;

use kube::{Resource, ResourceExt};

use crate::{Error, Result};

/// Identity of an object queued for reconciliation.
///
/// The textual form is `namespace/name`, or just `name` for cluster scoped
/// objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an object as delivered by the watch stream. Objects without a
    /// name cannot be addressed and yield an error.
    pub fn from_object<K: Resource>(obj: &K) -> Result<Self> {
        let name = obj
            .meta()
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidKey("object has no metadata.name".to_string()))?;
        Ok(Self {
            namespace: obj.namespace(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster_scoped(*name)),
            [ns, name] if !name.is_empty() => {
                if ns.is_empty() {
                    Ok(Self::cluster_scoped(*name))
                } else {
                    Ok(Self::new(*ns, *name))
                }
            }
            _ => Err(Error::InvalidKey(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn key_from_namespaced_object() {
        let dep = Deployment {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("default".into()),
                ..ObjectMeta::default()
            },
            ..Deployment::default()
        };
        let key = ObjectKey::from_object(&dep).unwrap();
        assert_eq!(key, ObjectKey::new("default", "web"));
        assert_eq!(key.to_string(), "default/web");
    }

    #[test]
    fn object_without_name_has_no_key() {
        let dep = Deployment::default();
        assert!(matches!(
            ObjectKey::from_object(&dep),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn parse_keys() {
        assert_eq!("default/web".parse::<ObjectKey>().unwrap(), ObjectKey::new("default", "web"));
        assert_eq!("node-1".parse::<ObjectKey>().unwrap(), ObjectKey::cluster_scoped("node-1"));
        assert_eq!("/node-1".parse::<ObjectKey>().unwrap(), ObjectKey::cluster_scoped("node-1"));
        assert!("a/b/c".parse::<ObjectKey>().is_err());
        assert!("default/".parse::<ObjectKey>().is_err());
        assert!("".parse::<ObjectKey>().is_err());
    }
}
