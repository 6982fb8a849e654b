//! Drives one NotebookValidationJob through its phases.
//!
//! Every invocation reads the job fresh, runs exactly one phase handler and writes status
//! back only when something changed. Waiting is always a requeue, never a sleep.

mod cleanup;
pub(crate) mod clock;
mod phases;
mod status;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::{Instrument, debug, info, instrument, trace_span, warn};
use tracing_error::{ExtractSpanTrace, SpanTrace};

use self::clock::{Clock, SystemClock};
use crate::build::registry::StrategyRegistry;
use crate::cluster::{Cluster, ClusterError, KubeCluster};
use crate::config::Config;
use crate::error::{SpannedErr, SpannedExt};
use crate::kubernetes_objects::labels::{Component, JobLabels, LABEL_COMPONENT};
use crate::kubernetes_objects::notebook_validation_job::{
    NotebookValidationJob, NotebookValidationJobStatus,
};
use crate::metrics::{MetricsSink, TracingMetrics};
use crate::serving;
use crate::shutdown::Shutdown;

/// Shared, read-only state handed to every reconcile.
pub(crate) struct Context<C> {
    cluster: C,
    registry: StrategyRegistry,
    config: Arc<Config>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl<C: Cluster> Context<C> {
    pub(crate) fn new(cluster: C, config: Arc<Config>, metrics: Arc<dyn MetricsSink>) -> Self {
        Context {
            cluster,
            registry: StrategyRegistry::new(&config.build),
            config,
            metrics,
            clock: Arc::new(SystemClock),
        }
    }
}

/// What the controller should do with the job after one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Requeue {
    Now,
    After(Duration),
    /// Wait for the next change to the job or one of its pods.
    Done,
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Self {
        match requeue {
            Requeue::Now => Action::requeue(Duration::ZERO),
            Requeue::After(delay) => Action::requeue(delay),
            Requeue::Done => Action::await_change(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Cluster(#[from] SpannedErr<ClusterError>),

    #[error("Job {0} has no namespace")]
    MissingNamespace(String),
}

impl ExtractSpanTrace for ReconcileError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            ReconcileError::Cluster(e) => e.span_trace(),
            ReconcileError::MissingNamespace(_) => None,
        }
    }
}

/// One reconcile pass over the job `namespace/name`.
#[instrument("reconcile", skip(ctx, namespace), fields(kubernetes_namespace = %namespace))]
pub(crate) async fn reconcile_job<C: Cluster>(
    ctx: &Context<C>,
    namespace: &str,
    name: &str,
) -> Result<Requeue, ReconcileError> {
    let started = Instant::now();
    let Some(job) = ctx
        .cluster
        .get_job(namespace, name)
        .instrument(trace_span!("get_job"))
        .await
        .with_span_trace()?
    else {
        debug!("Job {} no longer exists", name);
        return Ok(Requeue::Done);
    };
    let labels = JobLabels::for_job(&job);

    if job.metadata.deletion_timestamp.is_some() {
        cleanup::finalize(ctx, &job, &labels).await?;
        return Ok(Requeue::Done);
    }

    let now = ctx.clock.now();
    let current = job.status.clone().unwrap_or_default();
    let mut status = current.clone();

    let requeue = if let Some(observed) = current.observed_generation
        && job.metadata.generation.is_some_and(|generation| generation != observed)
    {
        info!(
            "Spec of job {} changed (generation {:?}, observed {}), restarting",
            name, job.metadata.generation, observed
        );
        cleanup::delete_children(ctx, &labels).await?;
        status = NotebookValidationJobStatus::default();
        Requeue::Now
    } else {
        match phases::run(ctx, &job, &labels, &mut status, now).await {
            Ok(requeue) => requeue,
            Err(failure) => status::handle_failure(ctx, &job, &mut status, failure, now).await?,
        }
    };

    if status != current {
        ctx.cluster
            .patch_job_status(namespace, name, &status)
            .instrument(trace_span!("patch_status", phase = %status.phase))
            .await
            .with_span_trace()?;
        if status.phase != current.phase {
            info!("Job {} moved from {} to {}", name, current.phase, status.phase);
            ctx.metrics
                .phase_transition(namespace, current.phase, status.phase);
        }
    }
    ctx.metrics
        .reconcile_duration(current.phase, started.elapsed());
    Ok(requeue)
}

async fn reconcile(
    job: Arc<NotebookValidationJob>,
    ctx: Arc<Context<KubeCluster>>,
) -> Result<Action, ReconcileError> {
    let name = job.name_any();
    let namespace = job
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;
    Ok(reconcile_job(&ctx, &namespace, &name).await?.into())
}

fn error_policy(
    job: Arc<NotebookValidationJob>,
    error: &ReconcileError,
    ctx: Arc<Context<KubeCluster>>,
) -> Action {
    warn!("Reconciling job {} failed: {}", job.name_any(), error);
    Action::requeue(ctx.config.polling.error_requeue)
}

/// Watches jobs and their validation pods until SIGINT or SIGTERM.
#[instrument("controller", skip_all)]
pub(crate) async fn run(config: Config, client: Client) -> Result<(), SpannedErr<kube::Error>> {
    let config = Arc::new(config);
    let (jobs, pods): (Api<NotebookValidationJob>, Api<Pod>) = match &config.namespace {
        Some(namespace) => (
            Api::namespaced(client.clone(), namespace),
            Api::namespaced(client.clone(), namespace),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    // fails fast when the CRD is not installed
    jobs.list(&ListParams::default().limit(1))
        .await
        .with_span_trace()?;

    let ctx = Arc::new(Context::new(
        KubeCluster::new(client),
        config.clone(),
        Arc::new(TracingMetrics),
    ));
    let available = ctx.registry.available(&ctx.cluster).await;
    if available.is_empty() {
        warn!("No build strategy is available, jobs with build enabled will fail");
    } else {
        info!("Available build strategies: {}", available.join(", "));
    }
    let platforms = serving::available_platforms(&ctx.cluster).await;
    if platforms.is_empty() {
        debug!("No model serving platform detected");
    } else {
        info!("Detected model serving platforms: {}", platforms.join(", "));
    }

    let shutdown = Shutdown::new();
    let pod_watch = watcher::Config::default().labels(&format!(
        "{}={}",
        LABEL_COMPONENT,
        Component::Validation
    ));
    info!(
        "Watching jobs in {} with concurrency {}",
        config.namespace.as_deref().unwrap_or("all namespaces"),
        config.concurrency
    );
    Controller::new(jobs, watcher::Config::default())
        .owns(pods, pod_watch)
        .with_config(controller::Config::default().concurrency(config.concurrency))
        .graceful_shutdown_on(shutdown.signalled())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((job, action)) => debug!("Reconciled {}: {:?}", job, action),
                Err(e) => warn!("Controller error: {}", e),
            }
        })
        .await;

    info!("Controller stopped.");
    Ok(())
}
