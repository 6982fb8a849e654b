use duration_str::deserialize_duration;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) struct PollingConfig {
    /// Requeue interval while a build is pending or running
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_build_poll_interval"
    )]
    pub(crate) build_poll_interval: Duration,

    /// Requeue interval while the validation pod is pending or running
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_pod_poll_interval"
    )]
    pub(crate) pod_poll_interval: Duration,

    /// Requeue interval after a reconcile error the controller could not classify
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_error_requeue"
    )]
    pub(crate) error_requeue: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            build_poll_interval: default_build_poll_interval(),
            pod_poll_interval: default_pod_poll_interval(),
            error_requeue: default_error_requeue(),
        }
    }
}

const fn default_build_poll_interval() -> Duration {
    Duration::from_secs(30)
}
const fn default_pod_poll_interval() -> Duration {
    Duration::from_secs(10)
}
const fn default_error_requeue() -> Duration {
    Duration::from_secs(15)
}
