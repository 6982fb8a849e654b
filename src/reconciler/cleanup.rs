use tracing::{Instrument, info, instrument, trace_span, warn};

use super::{Context, ReconcileError};
use crate::build::{Strategy, StrategyError};
use crate::cluster::{Cluster, ClusterError};
use crate::error::SpannedExt;
use crate::execution::delete_pods;
use crate::kubernetes_objects::JOB_FINALIZER;
use crate::kubernetes_objects::labels::JobLabels;
use crate::kubernetes_objects::notebook_validation_job::NotebookValidationJob;

/// Deletes every child carrying the job's labels, for every registered strategy.
///
/// A kind the cluster does not serve has nothing to delete.
pub(super) async fn delete_children<C: Cluster>(
    ctx: &Context<C>,
    labels: &JobLabels,
) -> Result<(), ReconcileError> {
    for strategy in ctx.registry.strategies() {
        let result = strategy
            .delete(&ctx.cluster, labels)
            .instrument(trace_span!("delete_build_resources", strategy = strategy.name()))
            .await;
        match result {
            Ok(()) | Err(StrategyError::Cluster(ClusterError::NotFound(_))) => {}
            Err(StrategyError::Cluster(e)) => Err(e).with_span_trace()?,
            Err(e @ StrategyError::InvalidConfig { .. }) => {
                warn!("Skipping cleanup for {}: {}", strategy.name(), e)
            }
        }
    }
    delete_pods(&ctx.cluster, labels)
        .instrument(trace_span!("delete_validation_pods"))
        .await
        .with_span_trace()?;
    Ok(())
}

/// Runs once the job carries a deletion timestamp. Writes no status.
#[instrument("finalize_job", skip_all, fields(job = %labels.owner))]
pub(super) async fn finalize<C: Cluster>(
    ctx: &Context<C>,
    job: &NotebookValidationJob,
    labels: &JobLabels,
) -> Result<(), ReconcileError> {
    if !job.metadata.finalizers.iter().flatten().any(|f| f == JOB_FINALIZER) {
        return Ok(());
    }
    delete_children(ctx, labels).await?;
    ctx.cluster
        .remove_finalizer(job, JOB_FINALIZER)
        .await
        .with_span_trace()?;
    info!("Cleaned up children of deleted job {}", labels.owner);
    Ok(())
}
