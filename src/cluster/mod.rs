//! The controller's only window onto the API server.
//!
//! Everything that reads or mutates cluster state goes through [`Cluster`], which keeps the
//! reconciler and the build strategies testable against [`fake::FakeCluster`].

#[cfg(test)]
pub mod fake;
pub mod kube_client;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::kubernetes_objects::notebook_validation_job::{
    NotebookValidationJob, NotebookValidationJobStatus,
};

pub use self::kube_client::KubeCluster;

/// An API kind whose presence a build strategy depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capability {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl Capability {
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(self.group, self.version, self.kind),
            self.plural,
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.group, self.version, self.kind)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("API server unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected by the API server: {0}")]
    Rejected(String),

    #[error("malformed object: {0}")]
    Malformed(String),
}

impl ClusterError {
    /// Where an API failure lands in the failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Rejected(_) => ErrorKind::ConfigurationError,
            ClusterError::Malformed(_) => ErrorKind::TerminalExecutionFailure,
            ClusterError::NotFound(_)
            | ClusterError::AlreadyExists(_)
            | ClusterError::Conflict(_)
            | ClusterError::Unavailable(_) => ErrorKind::TransientInfra,
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        let message = err.to_string();
        match &err {
            kube::Error::Api(response) => match (response.code, response.reason.as_str()) {
                (404, _) => ClusterError::NotFound(message),
                (409, "AlreadyExists") => ClusterError::AlreadyExists(message),
                (409, _) => ClusterError::Conflict(message),
                (400 | 403 | 422, _) => ClusterError::Rejected(message),
                _ => ClusterError::Unavailable(message),
            },
            kube::Error::SerdeError(_) => ClusterError::Malformed(message),
            _ => ClusterError::Unavailable(message),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Malformed(err.to_string())
    }
}

pub trait Cluster: Clone + Send + Sync + 'static {
    /// Read-only capability lookup.
    fn discover(
        &self,
        capability: &Capability,
    ) -> impl Future<Output = Result<bool, ClusterError>> + Send;

    fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<DynamicObject>, ClusterError>> + Send;

    fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: &DynamicObject,
    ) -> impl Future<Output = Result<DynamicObject, ClusterError>> + Send;

    /// Deleting something that is already gone succeeds.
    fn delete(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    fn logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> impl Future<Output = Result<String, ClusterError>> + Send;

    fn get_job(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<NotebookValidationJob>, ClusterError>> + Send;

    fn patch_job_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NotebookValidationJobStatus,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    fn add_finalizer(
        &self,
        job: &NotebookValidationJob,
        finalizer: &str,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    fn remove_finalizer(
        &self,
        job: &NotebookValidationJob,
        finalizer: &str,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;
}

pub fn pod_resource() -> ApiResource {
    ApiResource::erase::<Pod>(&())
}

pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject, ClusterError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

pub fn from_dynamic<K: DeserializeOwned>(object: &DynamicObject) -> Result<K, ClusterError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// Objects with a deletion timestamp no longer count as live.
pub fn is_live(object: &DynamicObject) -> bool {
    object.metadata.deletion_timestamp.is_none()
}

/// Lists live objects matching the selector, newest attempt last.
pub async fn list_live<C: Cluster>(
    cluster: &C,
    resource: &ApiResource,
    namespace: &str,
    selector: &BTreeMap<String, String>,
) -> Result<Vec<DynamicObject>, ClusterError> {
    let mut objects: Vec<_> = cluster
        .list(resource, namespace, selector)
        .await?
        .into_iter()
        .filter(is_live)
        .collect();
    objects.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    Ok(objects)
}

/// Picks the object with the highest attempt suffix (`<job>-build-<n>`, `<job>-validation-<n>`).
pub fn latest_attempt(objects: Vec<DynamicObject>) -> Option<DynamicObject> {
    objects.into_iter().max_by_key(|object| {
        object
            .name_any()
            .rsplit('-')
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0)
    })
}

/// Creates a template object unless an object of that name already exists.
pub async fn create_if_absent<C: Cluster>(
    cluster: &C,
    resource: &ApiResource,
    namespace: &str,
    object: &DynamicObject,
) -> Result<(), ClusterError> {
    match cluster.create(resource, namespace, object).await {
        Ok(_) | Err(ClusterError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
