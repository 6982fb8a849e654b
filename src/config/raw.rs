use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;
use thiserror::Error;

use super::Config;
use super::polling::PollingConfig;
use super::settings::{BuildSettings, ExecutionSettings};
use crate::retry::RetryPolicy;

#[cfg_attr(test, derive(PartialEq))]
#[derive(Deserialize, Debug, Clone, Default)]
pub(super) struct RawConfig {
    /// Namespace to watch. All namespaces when omitted.
    #[serde(default)]
    pub(super) namespace: Option<String>,

    /// Upper bound of concurrently reconciled jobs
    #[serde(default = "default_concurrency")]
    pub(super) concurrency: u16,

    #[serde(default)]
    pub(super) polling: PollingConfig,

    #[serde(default)]
    pub(super) retry: RawRetryConfig,

    #[serde(default)]
    pub(super) build: BuildSettings,

    #[serde(default)]
    pub(super) execution: ExecutionSettings,
}

const fn default_concurrency() -> u16 {
    8
}

#[cfg_attr(test, derive(PartialEq))]
#[derive(Deserialize, Debug, Clone)]
pub(super) struct RawRetryConfig {
    #[serde(default = "default_max_retries")]
    pub(super) max_retries: u32,

    /// Delay before each retry. The last entry repeats.
    ///
    /// Example: `[1m, 2m, 5m]`
    #[serde(default = "default_backoff")]
    pub(super) backoff: Vec<BackoffStep>,
}

impl Default for RawRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: default_backoff(),
        }
    }
}

#[cfg_attr(test, derive(PartialEq))]
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(transparent)]
pub(super) struct BackoffStep(#[serde(deserialize_with = "deserialize_duration")] Duration);

const fn default_max_retries() -> u32 {
    3
}

fn default_backoff() -> Vec<BackoffStep> {
    RetryPolicy::default()
        .backoff
        .into_iter()
        .map(BackoffStep)
        .collect()
}

#[derive(Error, Debug)]
pub enum ConfigParseError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("retry.max_retries must be at least 1")]
    ZeroMaxRetries,

    #[error("retry.backoff must list at least one delay")]
    EmptyBackoff,

    #[error("polling.{name} must be longer than zero")]
    ZeroInterval { name: &'static str },

    #[error("build.build_user must be a non-root uid")]
    RootBuildUser,

    #[error("'{name}' must not be empty")]
    EmptyValue { name: &'static str },

    #[error("namespace must not be empty, omit it to watch all namespaces")]
    EmptyNamespace,
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigParseError;
    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        if raw.concurrency == 0 {
            return Err(ConfigParseError::ZeroConcurrency);
        }
        if raw.namespace.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigParseError::EmptyNamespace);
        }
        if raw.retry.max_retries == 0 {
            return Err(ConfigParseError::ZeroMaxRetries);
        }
        if raw.retry.backoff.is_empty() {
            return Err(ConfigParseError::EmptyBackoff);
        }
        for (name, interval) in [
            ("build_poll_interval", raw.polling.build_poll_interval),
            ("pod_poll_interval", raw.polling.pod_poll_interval),
            ("error_requeue", raw.polling.error_requeue),
        ] {
            if interval.is_zero() {
                return Err(ConfigParseError::ZeroInterval { name });
            }
        }
        if raw.build.build_user <= 0 {
            return Err(ConfigParseError::RootBuildUser);
        }
        for (name, value) in [
            ("build.registry", &raw.build.registry),
            ("build.default_base_image", &raw.build.default_base_image),
            ("build.step_image", &raw.build.step_image),
            ("build.workspace_size", &raw.build.workspace_size),
            ("build.task_namespace", &raw.build.task_namespace),
            ("execution.git_clone_image", &raw.execution.git_clone_image),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigParseError::EmptyValue { name });
            }
        }

        let mut build = raw.build;
        build.registry = build.registry.trim_end_matches('/').to_string();

        Ok(Config {
            namespace: raw.namespace,
            concurrency: raw.concurrency,
            polling: raw.polling,
            retry: RetryPolicy {
                max_retries: raw.retry.max_retries,
                backoff: raw.retry.backoff.into_iter().map(|step| step.0).collect(),
            },
            build,
            execution: raw.execution,
        })
    }
}
