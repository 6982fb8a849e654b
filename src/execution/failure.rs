use std::fmt;

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodFailureReason {
    ImagePull,
    CrashLoop,
    OutOfMemory,
    InitContainer,
    ContainerConfig,
    SecurityPolicy,
    NonZeroExit,
    Unschedulable,
    DeadlineExceeded,
    Unknown,
}

impl PodFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PodFailureReason::ImagePull => "ImagePull",
            PodFailureReason::CrashLoop => "CrashLoop",
            PodFailureReason::OutOfMemory => "OOMKilled",
            PodFailureReason::InitContainer => "InitContainer",
            PodFailureReason::ContainerConfig => "ContainerConfig",
            PodFailureReason::SecurityPolicy => "SecurityPolicy",
            PodFailureReason::NonZeroExit => "NonZeroExit",
            PodFailureReason::Unschedulable => "Unschedulable",
            PodFailureReason::DeadlineExceeded => "DeadlineExceeded",
            PodFailureReason::Unknown => "Unknown",
        }
    }

    pub fn kind(self) -> ErrorKind {
        match self {
            PodFailureReason::ContainerConfig | PodFailureReason::SecurityPolicy => {
                ErrorKind::ConfigurationError
            }
            PodFailureReason::OutOfMemory | PodFailureReason::Unschedulable => {
                ErrorKind::ResourceExhaustion
            }
            PodFailureReason::DeadlineExceeded => ErrorKind::TerminalExecutionFailure,
            PodFailureReason::ImagePull
            | PodFailureReason::CrashLoop
            | PodFailureReason::InitContainer
            | PodFailureReason::NonZeroExit
            | PodFailureReason::Unknown => ErrorKind::RetriableExecutionFailure,
        }
    }
}

impl fmt::Display for PodFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root cause of a failed (or stuck) validation pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodFailure {
    pub reason: PodFailureReason,
    pub container: Option<String>,
    pub init_container: bool,
    pub exit_code: Option<i32>,
    /// Raw text reported by the kubelet
    pub message: Option<String>,
    pub suggested_action: String,
}

impl PodFailure {
    fn new(reason: PodFailureReason, suggested_action: impl Into<String>) -> Self {
        Self {
            reason,
            container: None,
            init_container: false,
            exit_code: None,
            message: None,
            suggested_action: suggested_action.into(),
        }
    }

    fn in_container(mut self, status: &ContainerStatus, init_container: bool) -> Self {
        self.container = Some(status.name.clone());
        self.init_container = init_container;
        self
    }

    fn with_message(mut self, message: Option<&String>) -> Self {
        self.message = message.filter(|m| !m.trim().is_empty()).cloned();
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.reason.kind()
    }

    /// One line naming the cause and what to do about it.
    pub fn summary(&self) -> String {
        let location = match (&self.container, self.init_container) {
            (Some(name), true) => format!(" in init container '{name}'"),
            (Some(name), false) => format!(" in container '{name}'"),
            (None, _) => String::new(),
        };
        format!(
            "{}{}: {}",
            self.reason, location, self.suggested_action
        )
    }
}

fn waiting_failure(status: &ContainerStatus, init_container: bool) -> Option<PodFailure> {
    let waiting = status.state.as_ref()?.waiting.as_ref()?;
    let subject = if init_container {
        "Init container"
    } else {
        "Container"
    };
    let failure = match waiting.reason.as_deref()? {
        "ImagePullBackOff" | "ErrImagePull" | "InvalidImageName" => PodFailure::new(
            PodFailureReason::ImagePull,
            format!(
                "{subject} image could not be pulled. Verify the image exists and the pull credentials, and check registry rate limits."
            ),
        ),
        "CrashLoopBackOff" => PodFailure::new(
            PodFailureReason::CrashLoop,
            format!(
                "{subject} is crashing repeatedly. Check its logs; the image may lack required dependencies."
            ),
        ),
        "CreateContainerConfigError" => PodFailure::new(
            PodFailureReason::ContainerConfig,
            format!(
                "{subject} configuration is invalid. Check that referenced secrets and config maps exist, and check volume mounts."
            ),
        ),
        "RunContainerError" if mentions_security_policy(waiting.message.as_deref()) => {
            PodFailure::new(
                PodFailureReason::SecurityPolicy,
                "Security policy rejected the container. Use an image that runs as a non-root user, or enable a build to skip the clone step.",
            )
        }
        "RunContainerError" => PodFailure::new(
            PodFailureReason::CrashLoop,
            format!("{subject} failed to start. Check the container command and logs."),
        ),
        _ => return None,
    };
    Some(
        failure
            .in_container(status, init_container)
            .with_message(waiting.message.as_ref()),
    )
}

fn terminated_failure(status: &ContainerStatus, init_container: bool) -> Option<PodFailure> {
    let terminated = status.state.as_ref()?.terminated.as_ref()?;
    if terminated.exit_code == 0 {
        return None;
    }
    let failure = if terminated.reason.as_deref() == Some("OOMKilled") {
        PodFailure::new(
            PodFailureReason::OutOfMemory,
            "Killed for exceeding its memory limit. Raise podConfig.resources.limits.memory.",
        )
    } else if init_container {
        PodFailure::new(
            PodFailureReason::InitContainer,
            format!(
                "Exited with code {}. Check that the repository, ref and notebook path are reachable with the configured credentials.",
                terminated.exit_code
            ),
        )
    } else {
        PodFailure::new(
            PodFailureReason::NonZeroExit,
            format!(
                "Exited with code {}. Check the pod logs for details.",
                terminated.exit_code
            ),
        )
    };
    let mut failure = failure
        .in_container(status, init_container)
        .with_message(terminated.message.as_ref());
    failure.exit_code = Some(terminated.exit_code);
    Some(failure)
}

fn mentions_security_policy(message: Option<&str>) -> bool {
    let message = message.unwrap_or_default().to_lowercase();
    ["runasnonroot", "scc", "security context", "securitycontext"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn container_failure(pod: &Pod) -> Option<PodFailure> {
    let status = pod.status.as_ref()?;
    let init = status.init_container_statuses.iter().flatten();
    let main = status.container_statuses.iter().flatten();

    init.map(|s| (s, true))
        .chain(main.map(|s| (s, false)))
        .find_map(|(s, is_init)| {
            waiting_failure(s, is_init).or_else(|| terminated_failure(s, is_init))
        })
}

fn unschedulable(pod: &Pod) -> Option<PodFailure> {
    let condition = pod
        .status
        .as_ref()?
        .conditions
        .iter()
        .flatten()
        .find(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
        })?;
    Some(
        PodFailure::new(
            PodFailureReason::Unschedulable,
            "Pod cannot be scheduled. Check resource requests, node selectors and cluster capacity.",
        )
        .with_message(condition.message.as_ref()),
    )
}

/// Explains a pod in phase `Failed`. Always yields a failure.
pub fn analyze_failed_pod(pod: &Pod) -> PodFailure {
    if let Some(status) = pod.status.as_ref()
        && status.reason.as_deref() == Some("DeadlineExceeded")
    {
        return PodFailure::new(
            PodFailureReason::DeadlineExceeded,
            "The notebook ran past the job timeout. Raise spec.timeout or shorten the notebook.",
        )
        .with_message(status.message.as_ref());
    }
    container_failure(pod)
        .or_else(|| unschedulable(pod))
        .unwrap_or_else(|| {
            PodFailure::new(
                PodFailureReason::Unknown,
                "Pod failed for an unknown reason. Check pod events and logs.",
            )
            .with_message(pod.status.as_ref().and_then(|s| s.message.as_ref()))
        })
}

/// Spots pods that are not failed yet but will never get anywhere on their own.
///
/// An unschedulable pod is left alone: capacity may still appear, and the job timeout
/// bounds the wait.
pub fn detect_stuck_pod(pod: &Pod) -> Option<PodFailure> {
    container_failure(pod)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(status: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "train-validation-1" },
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn test_init_container_image_pull() {
        let pod = pod(json!({
            "phase": "Pending",
            "initContainerStatuses": [{
                "name": "git-clone", "image": "alpine/git", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "waiting": { "reason": "ImagePullBackOff", "message": "Back-off pulling image" } },
            }],
        }));
        let failure = detect_stuck_pod(&pod).unwrap();
        assert_eq!(failure.reason, PodFailureReason::ImagePull);
        assert!(failure.init_container);
        assert_eq!(failure.container.as_deref(), Some("git-clone"));
        assert_eq!(failure.kind(), ErrorKind::RetriableExecutionFailure);
        assert!(failure.summary().starts_with("ImagePull in init container 'git-clone'"));
    }

    #[test]
    fn test_security_policy_violation() {
        let pod = pod(json!({
            "phase": "Pending",
            "containerStatuses": [{
                "name": "validator", "image": "x", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "waiting": {
                    "reason": "RunContainerError",
                    "message": "container has runAsNonRoot and image will run as root",
                } },
            }],
        }));
        let failure = detect_stuck_pod(&pod).unwrap();
        assert_eq!(failure.reason, PodFailureReason::SecurityPolicy);
        assert_eq!(failure.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_oom_killed() {
        let pod = pod(json!({
            "phase": "Failed",
            "containerStatuses": [{
                "name": "validator", "image": "x", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "terminated": { "exitCode": 137, "reason": "OOMKilled" } },
            }],
        }));
        let failure = analyze_failed_pod(&pod);
        assert_eq!(failure.reason, PodFailureReason::OutOfMemory);
        assert_eq!(failure.exit_code, Some(137));
        assert_eq!(failure.kind(), ErrorKind::ResourceExhaustion);
    }

    #[test]
    fn test_init_container_exit() {
        let pod = pod(json!({
            "phase": "Failed",
            "initContainerStatuses": [{
                "name": "git-clone", "image": "x", "imageID": "", "ready": false, "restartCount": 0,
                "state": { "terminated": { "exitCode": 128, "reason": "Error" } },
            }],
        }));
        let failure = analyze_failed_pod(&pod);
        assert_eq!(failure.reason, PodFailureReason::InitContainer);
        assert!(failure.suggested_action.contains("code 128"));
    }

    #[test]
    fn test_deadline_exceeded_is_terminal() {
        let pod = pod(json!({
            "phase": "Failed",
            "reason": "DeadlineExceeded",
            "message": "Pod was active on the node longer than the specified deadline",
        }));
        let failure = analyze_failed_pod(&pod);
        assert_eq!(failure.reason, PodFailureReason::DeadlineExceeded);
        assert_eq!(failure.kind(), ErrorKind::TerminalExecutionFailure);
    }

    #[test]
    fn test_unschedulable_only_when_failed() {
        let pod = pod(json!({
            "phase": "Pending",
            "conditions": [{
                "type": "PodScheduled", "status": "False", "reason": "Unschedulable",
                "message": "0/3 nodes are available: 3 Insufficient memory.",
            }],
        }));
        assert!(detect_stuck_pod(&pod).is_none());

        let failure = analyze_failed_pod(&pod);
        assert_eq!(failure.reason, PodFailureReason::Unschedulable);
        assert_eq!(
            failure.message.as_deref(),
            Some("0/3 nodes are available: 3 Insufficient memory.")
        );
    }

    #[test]
    fn test_healthy_pod_is_not_stuck() {
        let pod = pod(json!({
            "phase": "Running",
            "containerStatuses": [{
                "name": "validator", "image": "x", "imageID": "", "ready": true, "restartCount": 0,
                "state": { "running": {} },
            }],
        }));
        assert!(detect_stuck_pod(&pod).is_none());
        assert_eq!(analyze_failed_pod(&pod).reason, PodFailureReason::Unknown);
    }
}
