use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::clock::{parse_timestamp, remaining, timestamp};
use super::status::{condition, record_build, succeed};
use super::{Context, Requeue};
use crate::build::{BuildInfo, BuildRequest, Strategy, StrategyError};
use crate::cluster::{Cluster, ClusterError};
use crate::config::ExecutionSettings;
use crate::error::{ErrorKind, JobFailure};
use crate::execution::{Execution, execute};
use crate::kubernetes_objects::JOB_FINALIZER;
use crate::kubernetes_objects::labels::{Component, JobLabels};
use crate::kubernetes_objects::notebook_validation_job::{
    BuildPhase, BuildStatus, ConditionStatus, ConditionType, JobPhase, NotebookValidationJob,
    NotebookValidationJobStatus, Reason,
};
use crate::kubernetes_objects::validation_pod::PodRequest;
use crate::sanitize::redact_url;
use crate::serving::validate_models;

const GIT_SCHEMES: [&str; 5] = ["https://", "http://", "ssh://", "git://", "git@"];

type PhaseResult = Result<Requeue, JobFailure>;

fn cluster_failure(err: ClusterError) -> JobFailure {
    JobFailure::new(err.kind(), format!("Kubernetes API error: {err}"))
}

fn strategy_failure(err: StrategyError) -> JobFailure {
    JobFailure::new(err.kind(), err.to_string()).on(Component::Build)
}

/// The job's own timeout, or the configured default when the field is empty.
pub(super) fn job_timeout(
    job: &NotebookValidationJob,
    settings: &ExecutionSettings,
) -> Result<Duration, String> {
    let text = job.spec.timeout.trim();
    if text.is_empty() {
        return Ok(settings.default_timeout);
    }
    let timeout = duration_str::parse(text).map_err(|e| e.to_string())?;
    if timeout.is_zero() {
        return Err("timeout must be greater than zero".to_string());
    }
    Ok(timeout)
}

/// Static checks run once, before anything is created.
pub(super) fn validate_spec(
    job: &NotebookValidationJob,
    settings: &ExecutionSettings,
) -> Result<(), JobFailure> {
    let notebook = &job.spec.notebook;
    if !notebook.path.ends_with(".ipynb") {
        return Err(JobFailure::configuration(format!(
            "Notebook path '{}' must end with .ipynb",
            notebook.path
        )));
    }
    if !GIT_SCHEMES
        .iter()
        .any(|scheme| notebook.git.url.starts_with(scheme))
    {
        return Err(JobFailure::configuration(format!(
            "Git URL '{}' must use one of {}",
            redact_url(&notebook.git.url),
            GIT_SCHEMES.join(", ")
        )));
    }
    job_timeout(job, settings).map_err(|e| {
        JobFailure::configuration(format!("Invalid timeout '{}'", job.spec.timeout)).with_detail(e)
    })?;
    if job.enabled_build().is_none() && job.spec.pod_config.container_image.trim().is_empty() {
        return Err(JobFailure::configuration(
            "podConfig.containerImage is required when the build is disabled",
        ));
    }
    Ok(())
}

fn timed_out(
    job: &NotebookValidationJob,
    status: &NotebookValidationJobStatus,
    settings: &ExecutionSettings,
    now: DateTime<Utc>,
) -> Option<JobFailure> {
    let start = parse_timestamp(status.start_time.as_deref()?)?;
    let timeout = job_timeout(job, settings).ok()?;
    let elapsed = (now - start).to_std().ok()?;
    if elapsed <= timeout {
        return None;
    }
    let failure = JobFailure::new(
        ErrorKind::TerminalExecutionFailure,
        format!(
            "Job exceeded its timeout of {} in phase {}",
            job.spec.timeout, status.phase
        ),
    )
    .with_reason(Reason::Timeout);
    Some(match status.phase {
        JobPhase::Building => failure.on(Component::Build),
        JobPhase::ValidationRunning => failure.on(Component::Validation),
        _ => failure,
    })
}

/// Runs the handler of the current phase.
pub(super) async fn run<C: Cluster>(
    ctx: &Context<C>,
    job: &NotebookValidationJob,
    labels: &JobLabels,
    status: &mut NotebookValidationJobStatus,
    now: DateTime<Utc>,
) -> PhaseResult {
    if status.phase.is_terminal() {
        return Ok(Requeue::Done);
    }
    if let Some(failure) = timed_out(job, status, &ctx.config.execution, now) {
        return Err(failure);
    }
    if let Some(next) = status.next_retry_time.as_deref() {
        if let Some(wait) = remaining(now, next) {
            debug!("Retry of {} not due for {}s", labels.owner, wait.as_secs());
            return Ok(Requeue::After(wait));
        }
        status.next_retry_time = None;
    }

    match status.phase {
        JobPhase::Pending => pending(ctx, job, status, now).await,
        JobPhase::Initializing => initializing(ctx, job, status, now).await,
        JobPhase::Building => building(ctx, job, labels, status, now).await,
        JobPhase::BuildComplete => Ok(build_complete(status, now)),
        JobPhase::ValidationRunning => validation_running(ctx, job, labels, status, now).await,
        JobPhase::Succeeded | JobPhase::Failed => Ok(Requeue::Done),
    }
}

#[instrument("phase/pending", skip_all)]
async fn pending<C: Cluster>(
    ctx: &Context<C>,
    job: &NotebookValidationJob,
    status: &mut NotebookValidationJobStatus,
    now: DateTime<Utc>,
) -> PhaseResult {
    if !job.finalizers().iter().any(|f| f == JOB_FINALIZER) {
        ctx.cluster
            .add_finalizer(job, JOB_FINALIZER)
            .await
            .map_err(cluster_failure)?;
    }
    status.start_time.get_or_insert_with(|| timestamp(now));
    status.observed_generation = job.metadata.generation;
    condition(
        status,
        ConditionType::Progressing,
        ConditionStatus::True,
        Reason::InProgress,
        "Validation job accepted",
        now,
    );
    status.message = Some("Validating job spec".to_string());
    status.phase = JobPhase::Initializing;
    Ok(Requeue::Now)
}

#[instrument("phase/initializing", skip_all)]
async fn initializing<C: Cluster>(
    ctx: &Context<C>,
    job: &NotebookValidationJob,
    status: &mut NotebookValidationJobStatus,
    now: DateTime<Utc>,
) -> PhaseResult {
    validate_spec(job, &ctx.config.execution)?;

    let Some(build) = job.enabled_build() else {
        condition(
            status,
            ConditionType::BuildReady,
            ConditionStatus::True,
            Reason::BuildSkipped,
            format!("Using image {}", job.spec.pod_config.container_image),
            now,
        );
        condition(
            status,
            ConditionType::ValidationReady,
            ConditionStatus::False,
            Reason::ValidationPending,
            "Waiting for the validation pod",
            now,
        );
        status.message = Some("Starting validation".to_string());
        status.phase = JobPhase::ValidationRunning;
        return Ok(Requeue::Now);
    };

    let strategy = ctx
        .registry
        .select(&ctx.cluster, build)
        .await
        .map_err(|e| JobFailure::new(e.kind(), e.to_string()))?;
    info!("Job {} builds with strategy {}", job.name_any(), strategy.name());
    status.build_status = Some(BuildStatus {
        phase: BuildPhase::Pending,
        strategy: strategy.name().to_string(),
        ..Default::default()
    });
    condition(
        status,
        ConditionType::BuildReady,
        ConditionStatus::False,
        Reason::BuildPending,
        format!("Building with strategy {}", strategy.name()),
        now,
    );
    status.message = Some(format!("Building image with {}", strategy.name()));
    status.phase = JobPhase::Building;
    Ok(Requeue::Now)
}

#[instrument("phase/building", skip_all)]
async fn building<C: Cluster>(
    ctx: &Context<C>,
    job: &NotebookValidationJob,
    labels: &JobLabels,
    status: &mut NotebookValidationJobStatus,
    now: DateTime<Utc>,
) -> PhaseResult {
    let name = status
        .build_status
        .as_ref()
        .map(|b| b.strategy.clone())
        .unwrap_or_default();
    let Some(strategy) = ctx.registry.get(&name) else {
        return Err(JobFailure::new(
            ErrorKind::TerminalExecutionFailure,
            format!("Build strategy '{name}' recorded in status is not registered"),
        )
        .on(Component::Build));
    };
    let Some(config) = job.enabled_build() else {
        return Err(JobFailure::configuration("Build was disabled while building").on(Component::Build));
    };
    let poll = ctx.config.polling.build_poll_interval;

    let Some(info) = strategy
        .get_status(&ctx.cluster, labels)
        .await
        .map_err(strategy_failure)?
    else {
        let request = BuildRequest::for_job(job, labels, config, status.retry_count + 1);
        let info = strategy
            .create_build(&ctx.cluster, &request)
            .await
            .map_err(strategy_failure)?;
        ctx.metrics.build_created(&labels.namespace, strategy.name());
        info!("Created build {} with strategy {}", info.name, strategy.name());
        record_build(status, strategy.name(), &info, now);
        condition(
            status,
            ConditionType::BuildReady,
            ConditionStatus::False,
            Reason::BuildPending,
            format!("Build {} created", info.name),
            now,
        );
        return Ok(Requeue::After(poll));
    };

    match info.phase {
        BuildPhase::Pending | BuildPhase::Running | BuildPhase::Unknown => {
            record_build(status, strategy.name(), &info, now);
            let reason = if info.phase == BuildPhase::Pending {
                Reason::BuildPending
            } else {
                Reason::BuildInProgress
            };
            condition(
                status,
                ConditionType::BuildReady,
                ConditionStatus::False,
                reason,
                format!("Build {} is {}", info.name, info.phase),
                now,
            );
            Ok(Requeue::After(poll))
        }
        BuildPhase::Complete => {
            let image = strategy
                .get_image(&ctx.cluster, labels)
                .await
                .map_err(strategy_failure)?
                .ok_or_else(|| {
                    JobFailure::new(
                        ErrorKind::RetriableExecutionFailure,
                        format!("Build {} completed without an image reference", info.name),
                    )
                    .on(Component::Build)
                })?;
            let info = BuildInfo {
                image_reference: Some(image.clone()),
                ..info
            };
            record_build(status, strategy.name(), &info, now);
            ctx.metrics
                .build_finished(&labels.namespace, strategy.name(), true);
            condition(
                status,
                ConditionType::BuildReady,
                ConditionStatus::True,
                Reason::BuildComplete,
                format!("Built image {image}"),
                now,
            );
            status.message = Some(format!("Build {} complete", info.name));
            status.phase = JobPhase::BuildComplete;
            Ok(Requeue::Now)
        }
        BuildPhase::Failed | BuildPhase::Cancelled => {
            record_build(status, strategy.name(), &info, now);
            ctx.metrics
                .build_finished(&labels.namespace, strategy.name(), false);
            let kind = if info.configuration_failure {
                ErrorKind::ConfigurationError
            } else {
                ErrorKind::RetriableExecutionFailure
            };
            Err(JobFailure::new(
                kind,
                format!("Build {} {}", info.name, info.phase.as_str().to_lowercase()),
            )
            .with_detail(info.message.unwrap_or_default())
            .on(Component::Build))
        }
    }
}

fn build_complete(status: &mut NotebookValidationJobStatus, now: DateTime<Utc>) -> Requeue {
    condition(
        status,
        ConditionType::ValidationReady,
        ConditionStatus::False,
        Reason::ValidationPending,
        "Waiting for the validation pod",
        now,
    );
    status.message = Some("Starting validation".to_string());
    status.phase = JobPhase::ValidationRunning;
    Requeue::Now
}

#[instrument("phase/validation_running", skip_all)]
async fn validation_running<C: Cluster>(
    ctx: &Context<C>,
    job: &NotebookValidationJob,
    labels: &JobLabels,
    status: &mut NotebookValidationJobStatus,
    now: DateTime<Utc>,
) -> PhaseResult {
    let (image, built_image) = match (job.enabled_build(), &status.build_status) {
        (Some(_), Some(build)) => match &build.image_reference {
            Some(image) => (image.clone(), true),
            None => {
                return Err(JobFailure::new(
                    ErrorKind::TerminalExecutionFailure,
                    "Build finished without recording an image",
                ));
            }
        },
        _ => (job.spec.pod_config.container_image.clone(), false),
    };
    let timeout = job_timeout(job, &ctx.config.execution)
        .map_err(|e| JobFailure::configuration(format!("Invalid timeout: {e}")))?;
    if let Some(model) = job.enabled_model_validation()
        && status.model_validation_result.is_none()
    {
        let result = validate_models(&ctx.cluster, model, &labels.namespace)
            .await
            .map_err(cluster_failure)?;
        if result.success {
            info!("Model validation for job {} passed on {}", labels.owner, result.platform);
        } else {
            // advisory, the notebook still runs
            warn!(
                "Model validation for job {} failed: {}",
                labels.owner,
                result.message.as_deref().unwrap_or_default()
            );
        }
        ctx.metrics
            .model_validation(&labels.namespace, &result.platform, result.success);
        status.model_validation_result = Some(result);
    }
    let request = PodRequest {
        job,
        labels,
        image: &image,
        built_image,
        attempt: status.retry_count + 1,
        timeout,
        serving_platform: status
            .model_validation_result
            .as_ref()
            .map(|result| result.platform.as_str()),
    };
    let poll = ctx.config.polling.pod_poll_interval;

    match execute(&ctx.cluster, &request, &ctx.config.execution)
        .await
        .map_err(cluster_failure)?
    {
        Execution::Started { pod_name } => {
            condition(
                status,
                ConditionType::ValidationReady,
                ConditionStatus::False,
                Reason::ValidationPending,
                format!("Validation pod {pod_name} created"),
                now,
            );
            status.message = Some(format!("Validation pod {pod_name} created"));
            status.validation_pod_name = Some(pod_name);
            Ok(Requeue::After(poll))
        }
        Execution::Running { pod_name, phase } => {
            let reason = if phase == "Running" {
                Reason::ValidationInProgress
            } else {
                Reason::ValidationPending
            };
            condition(
                status,
                ConditionType::ValidationReady,
                ConditionStatus::False,
                reason,
                format!("Validation pod {pod_name} is {phase}"),
                now,
            );
            status.validation_pod_name = Some(pod_name);
            Ok(Requeue::After(poll))
        }
        Execution::Completed {
            pod_name,
            results,
            message,
            succeeded,
        } => {
            status.validation_pod_name = Some(pod_name);
            status.results = results;
            if !succeeded {
                return Err(JobFailure::new(ErrorKind::TerminalExecutionFailure, message)
                    .with_reason(Reason::ValidationFailed)
                    .on(Component::Validation));
            }
            info!("Job {} succeeded: {}", labels.owner, message);
            succeed(status, message, now);
            ctx.metrics.validation_finished(&labels.namespace, true);
            Ok(Requeue::Done)
        }
        Execution::Failed {
            pod_name,
            cause,
            failure,
        } => {
            status.validation_pod_name = Some(pod_name);
            ctx.metrics.pod_failure(&labels.namespace, cause.as_str());
            Err(failure)
        }
    }
}
