//! Pluggable image builders.
//!
//! Each backend wraps a native in-cluster build subsystem behind [`Strategy`]. The set is
//! closed ([`BuildStrategy`]) and a job only ever stores the strategy's name; the live value
//! is re-resolved from the [`registry::StrategyRegistry`] on every reconcile.

pub(crate) mod dockerfile;
pub(crate) mod pipeline;
pub(crate) mod registry;
pub(crate) mod source_build;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use kube::api::{ApiResource, DynamicObject};
use thiserror::Error;

use crate::cluster::{Capability, Cluster, ClusterError};
use crate::config::BuildSettings;
use crate::error::ErrorKind;
use crate::kubernetes_objects::labels::{Component, JobLabels};
use crate::kubernetes_objects::notebook_validation_job::{
    BuildConfigSpec, BuildPhase, GitSpec, NotebookValidationJob,
};

pub(crate) use self::pipeline::PipelineStrategy;
pub(crate) use self::source_build::SourceBuildStrategy;

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Kubernetes API error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("strategy '{strategy}' rejected the build configuration: {reason}")]
    InvalidConfig {
        strategy: &'static str,
        reason: String,
    },
}

impl StrategyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrategyError::Cluster(e) => e.kind(),
            StrategyError::InvalidConfig { .. } => ErrorKind::ConfigurationError,
        }
    }
}

/// Snapshot of one build run, mapped onto the common phase set.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildInfo {
    pub name: String,
    pub phase: BuildPhase,
    pub message: Option<String>,
    pub image_reference: Option<String>,
    pub start_time: Option<String>,
    pub completion_time: Option<String>,
    /// The backend refused the build definition itself; retrying will not help.
    pub configuration_failure: bool,
}

impl BuildInfo {
    pub fn pending(name: String) -> Self {
        BuildInfo {
            name,
            phase: BuildPhase::Pending,
            message: None,
            image_reference: None,
            start_time: None,
            completion_time: None,
            configuration_failure: false,
        }
    }
}

/// Everything a strategy needs to start a build for one job.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub labels: &'a JobLabels,
    pub owner: Option<OwnerReference>,
    pub git: &'a GitSpec,
    pub notebook_path: &'a str,
    pub config: &'a BuildConfigSpec,
    /// Image used as base when the build config names none
    pub container_image: &'a str,
    /// 1-based attempt number, `retryCount + 1`
    pub attempt: u32,
}

impl<'a> BuildRequest<'a> {
    pub fn for_job(
        job: &'a NotebookValidationJob,
        labels: &'a JobLabels,
        config: &'a BuildConfigSpec,
        attempt: u32,
    ) -> Self {
        BuildRequest {
            labels,
            owner: job.controller_owner_ref(&()),
            git: &job.spec.notebook.git,
            notebook_path: &job.spec.notebook.path,
            config,
            container_image: &job.spec.pod_config.container_image,
            attempt,
        }
    }

    pub fn build_name(&self) -> String {
        format!("{}-build-{}", self.labels.owner, self.attempt)
    }

    pub fn base_image(&self, settings: &BuildSettings) -> String {
        self.config
            .base_image
            .as_deref()
            .filter(|image| !image.is_empty())
            .or(Some(self.container_image).filter(|image| !image.is_empty()))
            .unwrap_or(&settings.default_base_image)
            .to_string()
    }

    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.owner.iter().cloned().collect()
    }

    /// Metadata shared by every object a strategy creates.
    pub fn metadata(&self, name: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "labels": self.labels.labels(Component::Build),
            "ownerReferences": self.owner_references(),
        })
    }
}

/// The contract every build backend fulfils.
///
/// Every operation locates resources through [`JobLabels`] only, and every operation is
/// safe to call when the resources are already gone.
pub(crate) trait Strategy {
    fn name(&self) -> &'static str;

    /// API kinds that must be served for this strategy to work.
    fn capabilities(&self) -> &'static [Capability];

    /// Every kind this strategy creates, used for cleanup.
    fn owned_resources(&self) -> Vec<ApiResource>;

    /// Capabilities the cluster does not serve. Read-only.
    async fn missing_capabilities<C: Cluster>(
        &self,
        cluster: &C,
    ) -> Result<Vec<Capability>, ClusterError> {
        let mut missing = Vec::new();
        for capability in self.capabilities() {
            if !cluster.discover(capability).await? {
                missing.push(*capability);
            }
        }
        Ok(missing)
    }

    async fn detect<C: Cluster>(&self, cluster: &C) -> Result<bool, ClusterError> {
        Ok(self.missing_capabilities(cluster).await?.is_empty())
    }

    fn validate(&self, config: &BuildConfigSpec) -> Result<(), StrategyError>;

    async fn create_build<C: Cluster>(
        &self,
        cluster: &C,
        request: &BuildRequest<'_>,
    ) -> Result<BuildInfo, StrategyError>;

    /// Status of the live build run, `None` when there is none.
    async fn get_status<C: Cluster>(
        &self,
        cluster: &C,
        target: &JobLabels,
    ) -> Result<Option<BuildInfo>, StrategyError>;

    async fn get_image<C: Cluster>(
        &self,
        cluster: &C,
        target: &JobLabels,
    ) -> Result<Option<String>, StrategyError> {
        Ok(self
            .get_status(cluster, target)
            .await?
            .filter(|info| info.phase == BuildPhase::Complete)
            .and_then(|info| info.image_reference))
    }

    /// Removes every resource this strategy created for the job.
    async fn delete<C: Cluster>(&self, cluster: &C, target: &JobLabels) -> Result<(), StrategyError>;
}

/// The closed set of build backends.
#[derive(Debug, Clone)]
pub(crate) enum BuildStrategy {
    SourceBuild(SourceBuildStrategy),
    Pipeline(PipelineStrategy),
}

impl Strategy for BuildStrategy {
    fn name(&self) -> &'static str {
        match self {
            BuildStrategy::SourceBuild(s) => s.name(),
            BuildStrategy::Pipeline(s) => s.name(),
        }
    }

    fn capabilities(&self) -> &'static [Capability] {
        match self {
            BuildStrategy::SourceBuild(s) => s.capabilities(),
            BuildStrategy::Pipeline(s) => s.capabilities(),
        }
    }

    fn owned_resources(&self) -> Vec<ApiResource> {
        match self {
            BuildStrategy::SourceBuild(s) => s.owned_resources(),
            BuildStrategy::Pipeline(s) => s.owned_resources(),
        }
    }

    fn validate(&self, config: &BuildConfigSpec) -> Result<(), StrategyError> {
        match self {
            BuildStrategy::SourceBuild(s) => s.validate(config),
            BuildStrategy::Pipeline(s) => s.validate(config),
        }
    }

    async fn create_build<C: Cluster>(
        &self,
        cluster: &C,
        request: &BuildRequest<'_>,
    ) -> Result<BuildInfo, StrategyError> {
        match self {
            BuildStrategy::SourceBuild(s) => s.create_build(cluster, request).await,
            BuildStrategy::Pipeline(s) => s.create_build(cluster, request).await,
        }
    }

    async fn get_status<C: Cluster>(
        &self,
        cluster: &C,
        target: &JobLabels,
    ) -> Result<Option<BuildInfo>, StrategyError> {
        match self {
            BuildStrategy::SourceBuild(s) => s.get_status(cluster, target).await,
            BuildStrategy::Pipeline(s) => s.get_status(cluster, target).await,
        }
    }

    async fn delete<C: Cluster>(&self, cluster: &C, target: &JobLabels) -> Result<(), StrategyError> {
        match self {
            BuildStrategy::SourceBuild(s) => s.delete(cluster, target).await,
            BuildStrategy::Pipeline(s) => s.delete(cluster, target).await,
        }
    }
}

/// Deletes every labeled object of the given kinds.
pub(crate) async fn delete_labeled<C: Cluster>(
    cluster: &C,
    resources: &[ApiResource],
    target: &JobLabels,
) -> Result<(), ClusterError> {
    let selector = target.job_selector();
    for resource in resources {
        for object in cluster.list(resource, &target.namespace, &selector).await? {
            cluster
                .delete(resource, &target.namespace, &object.name_any())
                .await?;
        }
    }
    Ok(())
}

/// Turns a JSON manifest into an object ready for [`Cluster::create`].
pub(crate) fn manifest(value: serde_json::Value) -> Result<DynamicObject, StrategyError> {
    serde_json::from_value(value).map_err(|e| StrategyError::Cluster(e.into()))
}

/// Non-empty string found at a JSON pointer into an object's body.
pub(crate) fn string_at<'a>(object: &'a DynamicObject, pointer: &str) -> Option<&'a str> {
    object
        .data
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// `registry/ns/name:tag` + digest → `registry/ns/name@digest`.
pub(crate) fn pin_digest(image: &str, digest: Option<&str>) -> String {
    match digest.filter(|d| !d.is_empty()) {
        Some(digest) => {
            let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
            let repository = match image[name_start..].find(':') {
                Some(colon) => &image[..name_start + colon],
                None => image,
            };
            format!("{repository}@{digest}")
        }
        None => image.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_digest() {
        assert_eq!(
            pin_digest(
                "image-registry.openshift-image-registry.svc:5000/ml/train-build:latest",
                Some("sha256:abc")
            ),
            "image-registry.openshift-image-registry.svc:5000/ml/train-build@sha256:abc"
        );
        assert_eq!(pin_digest("quay.io/org/img", Some("sha256:1")), "quay.io/org/img@sha256:1");
        assert_eq!(pin_digest("quay.io/org/img:1.0", None), "quay.io/org/img:1.0");
    }

    #[test]
    fn test_base_image_fallback_chain() {
        let labels = JobLabels {
            namespace: "ml".into(),
            job_id: "id".into(),
            owner: "train".into(),
        };
        let git = GitSpec {
            url: "https://github.com/org/repo.git".into(),
            git_ref: "main".into(),
            credentials_secret: None,
        };
        let config = BuildConfigSpec::default();
        let settings = BuildSettings::default();
        let mut request = BuildRequest {
            labels: &labels,
            owner: None,
            git: &git,
            notebook_path: "nb.ipynb",
            config: &config,
            container_image: "",
            attempt: 1,
        };
        assert_eq!(request.base_image(&settings), settings.default_base_image);
        request.container_image = "quay.io/custom:1";
        assert_eq!(request.base_image(&settings), "quay.io/custom:1");
        assert_eq!(request.build_name(), "train-build-1");

        let mut config = config.clone();
        config.base_image = Some("quay.io/base:2".into());
        request.config = &config;
        assert_eq!(request.base_image(&settings), "quay.io/base:2");
    }
}
