use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Client, Resource,
    api::{Api, DeleteParams, PostParams},
};
use thiserror::Error;
use tracing::*;

use crate::derived::{Derived, MANAGER_NAME};

/// Outcome of a cluster call, with the responses an idempotent reconcile
/// tolerates split out from real failures.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("conflict")]
    Conflict,

    #[error("Kube Error: {0}")]
    Other(#[source] kube::Error),
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => ApiError::NotFound,
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                ApiError::AlreadyExists
            }
            kube::Error::Api(ae) if ae.code == 409 => ApiError::Conflict,
            other => ApiError::Other(other),
        }
    }
}

impl From<ApiError> for crate::Error {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Other(e) => crate::Error::KubeError(e),
            unexpected => crate::Error::OtherError(format!("unexpected API response: {unexpected}")),
        }
    }
}

/// Namespaced CRUD for one kind of derived object.
#[async_trait]
pub trait ObjectClient<K: Send + Sync>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ApiError>;
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError>;
    /// Full update; `obj` carries the resourceVersion it was read at.
    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ApiError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError>;
}

/// [`ObjectClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(MANAGER_NAME.to_string()),
            ..PostParams::default()
        }
    }
}

#[async_trait]
impl<K> ObjectClient<K> for KubeClient
where
    K: Derived + Resource<Scope = NamespaceResourceScope>,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ApiError> {
        Ok(self.api::<K>(namespace).get(name).await?)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ApiError> {
        Ok(self
            .api::<K>(namespace)
            .create(&Self::post_params(), obj)
            .await?)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ApiError> {
        Ok(self
            .api::<K>(namespace)
            .replace(name, &Self::post_params(), obj)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let res = self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        if res.is_left() {
            debug!("{} {}/{} is being deleted", K::KIND, namespace, name);
        } else {
            debug!("{} {}/{} deleted", K::KIND, namespace, name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} from test"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn classifies_idempotent_responses() {
        assert!(matches!(ApiError::from(api_error(404, "NotFound")), ApiError::NotFound));
        assert!(matches!(
            ApiError::from(api_error(409, "AlreadyExists")),
            ApiError::AlreadyExists
        ));
        assert!(matches!(ApiError::from(api_error(409, "Conflict")), ApiError::Conflict));
    }

    #[test]
    fn other_failures_stay_errors() {
        assert!(matches!(
            ApiError::from(api_error(403, "Forbidden")),
            ApiError::Other(_)
        ));
        assert!(matches!(
            ApiError::from(api_error(500, "InternalError")),
            ApiError::Other(_)
        ));
    }
}
