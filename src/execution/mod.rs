//! Runs the notebook: one validation pod per attempt, polled without blocking.

pub(crate) mod failure;
pub(crate) mod results;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{Instrument, debug, info, instrument, trace_span, warn};

use self::failure::{PodFailure, PodFailureReason, analyze_failed_pod, detect_stuck_pod};
use self::results::{extract_error_lines, parse_report};
use crate::cluster::{
    Cluster, ClusterError, create_if_absent, from_dynamic, latest_attempt, list_live,
    pod_resource, to_dynamic,
};
use crate::config::ExecutionSettings;
use crate::error::JobFailure;
use crate::kubernetes_objects::labels::{Component, JobLabels};
use crate::kubernetes_objects::notebook_validation_job::{CellResult, Reason};
use crate::kubernetes_objects::validation_pod::{PodRequest, VALIDATOR_CONTAINER, validation_pod};

/// Where the current attempt stands after one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// No pod existed, one was just created.
    Started { pod_name: String },
    /// The pod is pending or running.
    Running { pod_name: String, phase: String },
    /// The pod ran to completion. `succeeded` is false when the notebook itself failed.
    Completed {
        pod_name: String,
        results: Vec<CellResult>,
        message: String,
        succeeded: bool,
    },
    /// The pod failed, or is stuck in a way it will not recover from.
    Failed {
        pod_name: String,
        cause: PodFailureReason,
        failure: JobFailure,
    },
}

/// Polls the validation pod of the current attempt, creating it first when there is none.
#[instrument("execute", skip_all, fields(job = %request.labels.owner, attempt = request.attempt))]
pub async fn execute<C: Cluster>(
    cluster: &C,
    request: &PodRequest<'_>,
    settings: &ExecutionSettings,
) -> Result<Execution, ClusterError> {
    let namespace = &request.labels.namespace;
    let selector = request.labels.selector(Component::Validation);
    let pods = list_live(cluster, &pod_resource(), namespace, &selector).await?;

    let Some(object) = latest_attempt(pods) else {
        let pod = validation_pod(request, settings)?;
        let pod_name = pod.name_any();
        create_if_absent(cluster, &pod_resource(), namespace, &to_dynamic(&pod)?)
            .instrument(trace_span!("create_validation_pod", pod = %pod_name))
            .await?;
        info!("Created validation pod {} with image {}", pod_name, request.image);
        return Ok(Execution::Started { pod_name });
    };

    let pod: Pod = from_dynamic(&object)?;
    let pod_name = pod.name_any();
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    debug!("Validation pod {} is {}", pod_name, phase);

    match phase.as_str() {
        "Succeeded" => Ok(collect_results(cluster, namespace, pod_name).await),
        "Failed" => {
            let failure = analyze_failed_pod(&pod);
            let container = failure
                .container
                .clone()
                .unwrap_or_else(|| VALIDATOR_CONTAINER.to_string());
            let logs = match cluster.logs(namespace, &pod_name, &container).await {
                Ok(logs) => Some(logs),
                Err(e) => {
                    debug!("No logs for failed pod {}: {}", pod_name, e);
                    None
                }
            };
            Ok(failed(pod_name, failure, logs.as_deref()))
        }
        _ => match detect_stuck_pod(&pod) {
            Some(failure) => {
                warn!("Validation pod {} is stuck: {}", pod_name, failure.summary());
                Ok(failed(pod_name, failure, None))
            }
            None => Ok(Execution::Running { pod_name, phase }),
        },
    }
}

async fn collect_results<C: Cluster>(cluster: &C, namespace: &str, pod_name: String) -> Execution {
    let logs = match cluster
        .logs(namespace, &pod_name, VALIDATOR_CONTAINER)
        .instrument(trace_span!("read_validator_logs", pod = %pod_name))
        .await
    {
        Ok(logs) => logs,
        Err(e) => {
            warn!("Failed to read logs of {}: {}", pod_name, e);
            return Execution::Completed {
                pod_name,
                results: Vec::new(),
                message: format!("Validation completed but failed to collect logs: {e}"),
                succeeded: true,
            };
        }
    };
    match parse_report(&logs) {
        Ok(report) => Execution::Completed {
            pod_name,
            results: report.cell_results(),
            message: report.message(),
            succeeded: !report.failed(),
        },
        Err(e) => {
            warn!("Failed to parse results of {}: {}", pod_name, e);
            Execution::Completed {
                pod_name,
                results: Vec::new(),
                message: format!("Validation completed but failed to parse results: {e}"),
                succeeded: true,
            }
        }
    }
}

fn failed(pod_name: String, failure: PodFailure, logs: Option<&str>) -> Execution {
    let mut detail = failure.message.clone().unwrap_or_default();
    if let Some(logs) = logs {
        if !detail.is_empty() {
            detail.push('\n');
        }
        detail.push_str(&extract_error_lines(logs));
    }
    let reason = match failure.reason {
        PodFailureReason::DeadlineExceeded => Reason::Timeout,
        _ => failure.kind().reason(),
    };
    let job_failure = JobFailure::new(
        failure.kind(),
        format!("Validation pod {} failed: {}", pod_name, failure.summary()),
    )
    .with_reason(reason)
    .with_detail(detail)
    .on(Component::Validation);
    Execution::Failed {
        pod_name,
        cause: failure.reason,
        failure: job_failure,
    }
}

/// Deletes every validation pod of the job. Pods already gone are fine.
pub async fn delete_pods<C: Cluster>(
    cluster: &C,
    labels: &JobLabels,
) -> Result<(), ClusterError> {
    let selector = labels.selector(Component::Validation);
    for pod in cluster
        .list(&pod_resource(), &labels.namespace, &selector)
        .await?
    {
        cluster
            .delete(&pod_resource(), &labels.namespace, &pod.name_any())
            .await?;
    }
    Ok(())
}
