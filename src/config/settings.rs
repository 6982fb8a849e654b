use duration_str::deserialize_duration;
use std::time::Duration;

use serde::Deserialize;

/// What `fallbackStrategy: auto` does when a repository has no dependency manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoFallback {
    /// Build from the base image without installing dependencies
    #[default]
    Skip,
    /// Fail the build
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) struct BuildSettings {
    /// Registry built images are pushed to
    #[serde(default = "default_registry")]
    pub(crate) registry: String,

    /// Base image when neither the build config nor the pod config names one
    #[serde(default = "default_base_image")]
    pub(crate) default_base_image: String,

    #[serde(default)]
    pub(crate) auto_fallback: AutoFallback,

    /// Size of the pipeline's shared workspace claim
    #[serde(default = "default_workspace_size")]
    pub(crate) workspace_size: String,

    /// Non-root uid and fsGroup of pipeline steps
    #[serde(default = "default_build_user")]
    pub(crate) build_user: i64,

    /// Image running the build file generation step
    #[serde(default = "default_step_image")]
    pub(crate) step_image: String,

    /// Namespace holding the `git-clone` and `buildah` tasks
    #[serde(default = "default_task_namespace")]
    pub(crate) task_namespace: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            default_base_image: default_base_image(),
            auto_fallback: AutoFallback::default(),
            workspace_size: default_workspace_size(),
            build_user: default_build_user(),
            step_image: default_step_image(),
            task_namespace: default_task_namespace(),
        }
    }
}

fn default_registry() -> String {
    "image-registry.openshift-image-registry.svc:5000".to_string()
}
fn default_base_image() -> String {
    "quay.io/jupyter/minimal-notebook:latest".to_string()
}
fn default_workspace_size() -> String {
    "1Gi".to_string()
}
const fn default_build_user() -> i64 {
    65532
}
fn default_step_image() -> String {
    "registry.access.redhat.com/ubi9/ubi-minimal:latest".to_string()
}
fn default_task_namespace() -> String {
    "openshift-pipelines".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) struct ExecutionSettings {
    /// Overall job timeout when the job leaves `timeout` empty
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_timeout"
    )]
    pub(crate) default_timeout: Duration,

    /// Service account of validation pods that name none
    #[serde(default = "default_service_account")]
    pub(crate) service_account: String,

    /// Image of the init container cloning the repository
    #[serde(default = "default_git_clone_image")]
    pub(crate) git_clone_image: String,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            service_account: default_service_account(),
            git_clone_image: default_git_clone_image(),
        }
    }
}

const fn default_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_service_account() -> String {
    "jupyter-notebook-validator-runner".to_string()
}
fn default_git_clone_image() -> String {
    "alpine/git:2.45.2".to_string()
}
