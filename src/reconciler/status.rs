use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use super::clock::timestamp;
use super::{Context, ReconcileError, Requeue};
use crate::build::{BuildInfo, Strategy, StrategyError};
use crate::cluster::{Cluster, ClusterError};
use crate::error::{JobFailure, SpannedExt};
use crate::execution::delete_pods;
use crate::kubernetes_objects::conditions::set_condition;
use crate::kubernetes_objects::labels::{Component, JobLabels};
use crate::kubernetes_objects::notebook_validation_job::{
    BuildPhase, BuildStatus, ConditionStatus, ConditionType, JobPhase, NotebookValidationJob,
    NotebookValidationJobStatus, Reason,
};
use crate::retry::{Classification, classify};
use crate::sanitize::truncate_diagnostic;

pub(super) fn condition(
    status: &mut NotebookValidationJobStatus,
    type_: ConditionType,
    condition_status: ConditionStatus,
    reason: Reason,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    set_condition(
        &mut status.conditions,
        type_,
        condition_status,
        reason,
        message,
        &timestamp(now),
    );
}

/// Copies a build snapshot into status, keeping the image invariant.
pub(super) fn record_build(
    status: &mut NotebookValidationJobStatus,
    strategy: &str,
    info: &BuildInfo,
    now: DateTime<Utc>,
) {
    let previous = status.build_status.take().unwrap_or_default();
    let complete = info.phase == BuildPhase::Complete;
    let finished = matches!(
        info.phase,
        BuildPhase::Complete | BuildPhase::Failed | BuildPhase::Cancelled
    );
    let same_build = previous.build_name.as_deref() == Some(info.name.as_str());
    status.build_status = Some(BuildStatus {
        phase: info.phase,
        strategy: strategy.to_string(),
        image_reference: info.image_reference.clone().filter(|_| complete),
        message: info.message.as_deref().map(truncate_diagnostic),
        start_time: info
            .start_time
            .clone()
            .or(previous.start_time.filter(|_| same_build))
            .or_else(|| Some(timestamp(now))),
        completion_time: if finished {
            info.completion_time
                .clone()
                .or(previous.completion_time.filter(|_| same_build))
                .or_else(|| Some(timestamp(now)))
        } else {
            None
        },
        build_name: Some(info.name.clone()),
    });
}

/// Terminal success.
pub(super) fn succeed(status: &mut NotebookValidationJobStatus, message: String, now: DateTime<Utc>) {
    status.phase = JobPhase::Succeeded;
    status.reason = None;
    status.next_retry_time = None;
    status.completion_time = Some(timestamp(now));
    condition(
        status,
        ConditionType::ValidationReady,
        ConditionStatus::True,
        Reason::ValidationSucceeded,
        message.clone(),
        now,
    );
    condition(
        status,
        ConditionType::Available,
        ConditionStatus::True,
        Reason::Succeeded,
        "Validation results are available",
        now,
    );
    condition(
        status,
        ConditionType::Progressing,
        ConditionStatus::False,
        Reason::Succeeded,
        "Validation finished",
        now,
    );
    status.message = Some(message);
}

/// Terminal failure. Child resources are left in place for inspection.
pub(super) fn fail(
    status: &mut NotebookValidationJobStatus,
    reason: Reason,
    component: Option<Component>,
    message: String,
    now: DateTime<Utc>,
) {
    status.phase = JobPhase::Failed;
    status.reason = Some(reason);
    status.next_retry_time = None;
    status.completion_time = Some(timestamp(now));
    match component {
        Some(Component::Build) => condition(
            status,
            ConditionType::BuildReady,
            ConditionStatus::False,
            Reason::BuildFailed,
            message.clone(),
            now,
        ),
        Some(Component::Validation) => condition(
            status,
            ConditionType::ValidationReady,
            ConditionStatus::False,
            Reason::ValidationFailed,
            message.clone(),
            now,
        ),
        None => {}
    }
    condition(
        status,
        ConditionType::Available,
        ConditionStatus::False,
        reason,
        message.clone(),
        now,
    );
    condition(
        status,
        ConditionType::Progressing,
        ConditionStatus::False,
        Reason::Failed,
        "Validation stopped",
        now,
    );
    status.message = Some(message);
}

/// Classifies a handler failure and records the decision.
///
/// Transient failures only requeue: status, retry count and children stay as they are.
/// Retriable failures delete the failed child before anything is written, so a failed
/// deletion leaves status untouched and the same decision is made again on the next pass.
pub(super) async fn handle_failure<C: Cluster>(
    ctx: &Context<C>,
    job: &NotebookValidationJob,
    status: &mut NotebookValidationJobStatus,
    failure: JobFailure,
    now: DateTime<Utc>,
) -> Result<Requeue, ReconcileError> {
    let namespace = job.metadata.namespace.as_deref().unwrap_or_default();
    let decision = classify(failure.kind, status.retry_count, &ctx.config.retry);
    let delay = decision.delay.unwrap_or(Duration::ZERO);

    if decision.classification == Classification::Transient {
        warn!(
            "Job {} hit a transient error, requeue in {}s: {}",
            job.metadata.name.as_deref().unwrap_or_default(),
            delay.as_secs(),
            failure.user_message()
        );
        ctx.metrics.retry_scheduled(namespace, decision.reason);
        return Ok(Requeue::After(delay));
    }

    // timed out children are stopped, other terminal failures keep theirs for inspection
    if decision.deletes_resource() || failure.reason == Reason::Timeout {
        let labels = JobLabels::for_job(job);
        match failure.component {
            Some(Component::Build) => delete_build(ctx, status, &labels).await?,
            Some(Component::Validation) => {
                delete_pods(&ctx.cluster, &labels).await.with_span_trace()?;
                status.validation_pod_name = None;
            }
            None => {}
        }
    }

    status.retry_count = decision.retry_count;
    let message = failure.user_message();

    if decision.is_terminal() {
        let (reason, message) = if decision.reason == Reason::RetriesExhausted {
            (
                Reason::RetriesExhausted,
                format!(
                    "Retries exhausted after {} attempts. Last failure: {}",
                    decision.retry_count, message
                ),
            )
        } else {
            (failure.reason, message)
        };
        error!(
            "Job {} failed ({:?}): {}",
            job.metadata.name.as_deref().unwrap_or_default(),
            reason,
            message
        );
        fail(status, reason, failure.component, truncate_diagnostic(&message), now);
        ctx.metrics.validation_finished(namespace, false);
        return Ok(Requeue::Done);
    }

    warn!(
        "Job {} hit {:?}, retry {}/{} in {}s: {}",
        job.metadata.name.as_deref().unwrap_or_default(),
        failure.kind,
        decision.retry_count,
        ctx.config.retry.max_retries,
        delay.as_secs(),
        message
    );
    status.last_retry_time = Some(timestamp(now));
    status.next_retry_time = chrono::Duration::from_std(delay)
        .ok()
        .map(|d| timestamp(now + d));
    status.message = Some(truncate_diagnostic(&format!(
        "{} Retry {}/{} scheduled in {}s.",
        message,
        decision.retry_count,
        ctx.config.retry.max_retries,
        delay.as_secs()
    )));
    ctx.metrics.retry_scheduled(namespace, decision.reason);
    Ok(Requeue::After(delay))
}

async fn delete_build<C: Cluster>(
    ctx: &Context<C>,
    status: &NotebookValidationJobStatus,
    labels: &JobLabels,
) -> Result<(), ReconcileError> {
    let Some(strategy) = status
        .build_status
        .as_ref()
        .and_then(|b| ctx.registry.get(&b.strategy))
    else {
        return Ok(());
    };
    match strategy.delete(&ctx.cluster, labels).await {
        Ok(()) | Err(StrategyError::Cluster(ClusterError::NotFound(_))) => Ok(()),
        Err(StrategyError::Cluster(e)) => Err(e).with_span_trace().map_err(ReconcileError::from),
        Err(e @ StrategyError::InvalidConfig { .. }) => {
            warn!("Could not delete failed build: {}", e);
            Ok(())
        }
    }
}
